#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kinfeed::application::feed::FeedService;
use kinfeed::application::friends::FriendService;
use kinfeed::application::posts::PostService;
use kinfeed::application::repos::{FeedRepo, RepoError};
use kinfeed::broker::{
    Broker, BrokerError, ConsumerSpec, MemoryBroker, Publisher, Subscription,
};
use kinfeed::cache::{CacheConfig, FeedCache, MemoryBackend, SubscriberCache};
use kinfeed::feed::{FeedUpdater, LiveUpdateMultiplexer, NotificationPublisher, UserTopics};
use kinfeed::infra::memory::InMemoryRepositories;
use kinfeed_api_types::{Post, UserId};
use tokio_util::sync::CancellationToken;

pub const EVENTS_KEY: &str = "feed.events";
pub const EVENTS_QUEUE: &str = "feed.events";
pub const MAX_FEED_LEN: usize = 20;

pub fn topics() -> UserTopics {
    UserTopics {
        routing_key: "feed.user.{user_id}".to_string(),
        queue: "feed.user.{user_id}.{instance_id}".to_string(),
        consumer_tag: "live-{user_id}-{instance_id}".to_string(),
        instance_id: "test".to_string(),
    }
}

pub fn cache_config() -> CacheConfig {
    CacheConfig {
        lock_retry_delay: Duration::from_millis(10),
        ..CacheConfig::default()
    }
}

/// Publisher whose broker is always unreachable.
pub struct FailingPublisher;

#[async_trait]
impl Publisher for FailingPublisher {
    async fn publish(&self, routing_key: &str, _body: Vec<u8>) -> Result<(), BrokerError> {
        Err(BrokerError::Publish {
            routing_key: routing_key.to_string(),
            message: "connection refused".to_string(),
        })
    }
}

/// Feed loader that fails for selected users and delegates otherwise.
pub struct FlakyFeedRepo {
    inner: Arc<InMemoryRepositories>,
    failing: Mutex<HashSet<UserId>>,
    loads: AtomicUsize,
}

impl FlakyFeedRepo {
    pub fn new(inner: Arc<InMemoryRepositories>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            loads: AtomicUsize::new(0),
        }
    }

    /// Number of feed recomputes attempted so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn fail_for(&self, user: UserId) {
        self.failing.lock().expect("failing set").insert(user);
    }
}

#[async_trait]
impl FeedRepo for FlakyFeedRepo {
    async fn load_feed_for_user(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Post>, RepoError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().expect("failing set").contains(&user) {
            return Err(RepoError::from_persistence("connection reset"));
        }
        self.inner.load_feed_for_user(user, limit, offset).await
    }
}

/// The full in-process pipeline: storage, caches, broker, updater and live fan-out.
pub struct Harness {
    pub repos: Arc<InMemoryRepositories>,
    pub feed_repo: Arc<FlakyFeedRepo>,
    pub feed_backend: Arc<MemoryBackend>,
    pub broker: MemoryBroker,
    pub feeds: Arc<FeedCache>,
    pub subscribers: Arc<SubscriberCache>,
    pub updater: Arc<FeedUpdater>,
    pub live: LiveUpdateMultiplexer,
    pub feed_service: Arc<FeedService>,
    pub posts: Arc<PostService>,
    pub friends: Arc<FriendService>,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_cache_config(cache_config())
    }

    pub fn with_cache_config(config: CacheConfig) -> Self {
        let repos = Arc::new(InMemoryRepositories::new());
        let feed_repo = Arc::new(FlakyFeedRepo::new(repos.clone()));
        let broker = MemoryBroker::new();
        let publisher: Arc<dyn Publisher> = Arc::new(broker.clone());

        let feed_backend = Arc::new(MemoryBackend::new());
        let subscriber_backend = Arc::new(MemoryBackend::new());
        let feeds = Arc::new(FeedCache::new(
            feed_backend.clone(),
            feed_backend.clone(),
            config,
            feed_repo.clone(),
            MAX_FEED_LEN,
        ));
        let subscribers = Arc::new(SubscriberCache::new(
            subscriber_backend.clone(),
            subscriber_backend,
            config,
            repos.clone(),
        ));

        let notifier = Arc::new(NotificationPublisher::new(publisher.clone(), EVENTS_KEY));
        let updater = Arc::new(FeedUpdater::new(
            feeds.clone(),
            subscribers.clone(),
            publisher,
            topics(),
        ));
        let live = LiveUpdateMultiplexer::new(Arc::new(broker.clone()), topics(), 8);

        Self {
            feed_service: Arc::new(FeedService::new(feeds.clone(), notifier.clone())),
            posts: Arc::new(PostService::new(repos.clone(), notifier.clone())),
            friends: Arc::new(FriendService::new(repos.clone(), notifier)),
            repos,
            feed_repo,
            feed_backend,
            broker,
            feeds,
            subscribers,
            updater,
            live,
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts consuming domain events in the background.
    pub async fn start_updater(&self) -> tokio::task::JoinHandle<()> {
        self.start_updater_as("feed-updater-test", self.shutdown.clone())
            .await
    }

    /// Starts another consumer on the shared events queue, the way a second
    /// process sharing the same broker and caches would.
    pub async fn start_updater_as(
        &self,
        tag: &str,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let events = self
            .broker
            .consume(ConsumerSpec {
                queue: EVENTS_QUEUE.to_string(),
                tag: tag.to_string(),
                routing_key: EVENTS_KEY.to_string(),
                durable: true,
            })
            .await
            .expect("consume events");
        self.updater.clone().spawn(events, shutdown)
    }

    /// Binds a private queue to `user`'s update topic.
    pub async fn watch_updates(&self, user: UserId, queue: &str) -> Subscription {
        self.broker
            .consume(ConsumerSpec {
                queue: queue.to_string(),
                tag: format!("watch-{queue}"),
                routing_key: topics().routing_key(user),
                durable: false,
            })
            .await
            .expect("consume user updates")
    }
}

pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}
