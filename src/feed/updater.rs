//! Consumes domain events and keeps cached feeds current.
//!
//! Each event triggers a full recompute of the affected feeds, followed by a
//! [`FeedUpdate`] on every affected user's update channel.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kinfeed_api_types::{FeedUpdate, Post, UserId};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{BrokerError, Publisher, Subscription};
use crate::cache::{CacheError, FeedCache, SubscriberCache};
use crate::events::DomainEvent;

use super::topics::UserTopics;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to encode feed update for {user_id}: {message}")]
    Encode { user_id: UserId, message: String },
    #[error(transparent)]
    Publish(#[from] BrokerError),
}

pub struct FeedUpdater {
    feeds: Arc<FeedCache>,
    subscribers: Arc<SubscriberCache>,
    publisher: Arc<dyn Publisher>,
    topics: UserTopics,
}

impl FeedUpdater {
    pub fn new(
        feeds: Arc<FeedCache>,
        subscribers: Arc<SubscriberCache>,
        publisher: Arc<dyn Publisher>,
        topics: UserTopics,
    ) -> Self {
        Self {
            feeds,
            subscribers,
            publisher,
            topics,
        }
    }

    /// Runs the consume loop until `shutdown` fires or the stream ends, then
    /// stops the consumer.
    pub fn spawn(
        self: Arc<Self>,
        subscription: Subscription,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(subscription, shutdown).await })
    }

    async fn run(&self, subscription: Subscription, shutdown: CancellationToken) {
        let Subscription {
            consumer,
            mut deliveries,
        } = subscription;
        info!(consumer_tag = consumer.tag(), "Feed updater started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = deliveries.next() => {
                    let Some(delivery) = delivery else {
                        warn!(consumer_tag = consumer.tag(), "Feed event stream ended");
                        break;
                    };
                    if let Err(err) = self.handle_message(&delivery.body).await {
                        error!(error = %err, "Failed processing domain event");
                    }
                    // Failed events are not retried, so they are settled too.
                    if let Err(err) = delivery.ack().await {
                        warn!(consumer_tag = consumer.tag(), error = %err, "Failed to acknowledge domain event");
                    }
                }
            }
        }

        if let Err(err) = consumer.stop().await {
            warn!(consumer_tag = consumer.tag(), error = %err, "Failed to stop feed event consumer");
        }
        info!(consumer_tag = consumer.tag(), "Feed updater stopped");
    }

    /// Decodes and dispatches one message. Undecodable messages are dropped.
    pub async fn handle_message(&self, body: &[u8]) -> Result<(), UpdateError> {
        match DomainEvent::decode(body) {
            Ok(event) => self.dispatch(event).await,
            Err(err) => {
                counter!("kinfeed_feed_events_dropped_total").increment(1);
                warn!(error = %err, bytes = body.len(), "Discarding undecodable domain event");
                Ok(())
            }
        }
    }

    #[instrument(skip_all, fields(event_kind = event.kind().as_str()))]
    pub async fn dispatch(&self, event: DomainEvent) -> Result<(), UpdateError> {
        let kind = event.kind();
        counter!("kinfeed_feed_events_total", "kind" => kind.as_str()).increment(1);
        let started = Instant::now();

        let result = match event {
            DomainEvent::InvalidateAll => self.invalidate_all().await,
            DomainEvent::FriendAdded { user_id, friend_id }
            | DomainEvent::FriendRemoved { user_id, friend_id } => {
                self.refresh_friendship(user_id, friend_id).await
            }
            DomainEvent::PostCreated { user_id, .. }
            | DomainEvent::PostUpdated { user_id, .. }
            | DomainEvent::PostDeleted { user_id, .. } => self.fan_out(user_id).await,
        };

        histogram!("kinfeed_feed_dispatch_ms", "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn invalidate_all(&self) -> Result<(), UpdateError> {
        let mut last_error: Option<UpdateError> = None;
        if let Err(err) = self.subscribers.invalidate_all().await {
            error!(error = %err, "Failed to flush subscriber cache");
            last_error = Some(err.into());
        }
        if let Err(err) = self.feeds.invalidate_all().await {
            error!(error = %err, "Failed to flush feed cache");
            last_error = Some(err.into());
        }
        last_error.map_or(Ok(()), Err)
    }

    /// `user` started or stopped seeing `friend`'s posts.
    async fn refresh_friendship(&self, user: UserId, friend: UserId) -> Result<(), UpdateError> {
        let mut last_error: Option<UpdateError> = None;

        if let Err(err) = self.subscribers.load(friend).await {
            error!(user_id = %friend, error = %err, "Failed to reload subscribers");
            last_error = Some(err.into());
        }

        match self.feeds.load(user).await {
            Ok(posts) => {
                if let Err(err) = self.publish_update(user, posts).await {
                    last_error = Some(err);
                }
            }
            Err(err) => {
                error!(user_id = %user, error = %err, "Failed to reload feed");
                last_error = Some(err.into());
            }
        }

        last_error.map_or(Ok(()), Err)
    }

    /// Recomputes the feed of every subscriber of `author`. A failing
    /// subscriber does not stop the rest; the last failure is returned.
    async fn fan_out(&self, author: UserId) -> Result<(), UpdateError> {
        let subscribers = self.subscribers.get_or_load(author).await.inspect_err(|err| {
            error!(user_id = %author, error = %err, "Failed to load subscribers");
        })?;
        debug!(user_id = %author, subscribers = subscribers.len(), "Fanning out feed reloads");

        let mut last_error: Option<UpdateError> = None;
        for subscriber in subscribers {
            let outcome = match self.feeds.load(subscriber).await {
                Ok(posts) => self.publish_update(subscriber, posts).await,
                Err(err) => {
                    error!(user_id = %subscriber, error = %err, "Failed to reload feed");
                    Err(err.into())
                }
            };
            if let Err(err) = outcome {
                counter!("kinfeed_feed_fanout_failures_total").increment(1);
                last_error = Some(err);
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    async fn publish_update(&self, user: UserId, posts: Vec<Post>) -> Result<(), UpdateError> {
        let routing_key = self.topics.routing_key(user);
        let update = FeedUpdate {
            user_id: user,
            posts,
        };
        let body = serde_json::to_vec(&update).map_err(|err| UpdateError::Encode {
            user_id: user,
            message: err.to_string(),
        })?;

        self.publisher
            .publish(&routing_key, body)
            .await
            .inspect_err(|err| {
                error!(
                    user_id = %user,
                    routing_key = routing_key.as_str(),
                    error = %err,
                    "Failed to publish feed update"
                );
            })?;
        debug!(
            user_id = %user,
            routing_key = routing_key.as_str(),
            posts = update.posts.len(),
            "Published feed update"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::stream;
    use kinfeed_api_types::PostId;
    use time::OffsetDateTime;

    use super::*;
    use crate::application::repos::{FriendsRepo, PostsRepo};
    use crate::broker::{
        Acknowledger, Broker, ConsumerSpec, Delivery, MemoryBroker, TopicConsumer,
    };
    use crate::cache::{CacheConfig, MemoryBackend};
    use crate::infra::memory::InMemoryRepositories;

    struct CountingAck(Arc<AtomicUsize>);

    #[async_trait]
    impl Acknowledger for CountingAck {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingConsumer(Arc<AtomicUsize>);

    #[async_trait]
    impl TopicConsumer for CountingConsumer {
        fn tag(&self) -> &str {
            "feed-updater-unit"
        }

        async fn stop(&self) -> Result<(), BrokerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn topics() -> UserTopics {
        UserTopics {
            routing_key: "feed.user.{user_id}".into(),
            queue: "feed.user.{user_id}.{instance_id}".into(),
            consumer_tag: "live-{user_id}-{instance_id}".into(),
            instance_id: "unit".into(),
        }
    }

    fn updater(repos: Arc<InMemoryRepositories>, broker: &MemoryBroker) -> Arc<FeedUpdater> {
        let feed_backend = Arc::new(MemoryBackend::new());
        let subscriber_backend = Arc::new(MemoryBackend::new());
        Arc::new(FeedUpdater::new(
            Arc::new(FeedCache::new(
                feed_backend.clone(),
                feed_backend,
                CacheConfig::default(),
                repos.clone(),
                10,
            )),
            Arc::new(SubscriberCache::new(
                subscriber_backend.clone(),
                subscriber_backend,
                CacheConfig::default(),
                repos,
            )),
            Arc::new(broker.clone()),
            topics(),
        ))
    }

    #[tokio::test]
    async fn deliveries_are_acknowledged_after_handling() {
        let broker = MemoryBroker::new();
        let updater = updater(Arc::new(InMemoryRepositories::new()), &broker);
        let acks = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let bodies = vec![
            b"not json".to_vec(),
            DomainEvent::InvalidateAll.encode().expect("encode"),
        ];
        let deliveries: Vec<Delivery> = bodies
            .into_iter()
            .map(|body| {
                Delivery::with_acker("feed.events", body, Box::new(CountingAck(acks.clone())))
            })
            .collect();
        let subscription = Subscription {
            consumer: Box::new(CountingConsumer(stops.clone())),
            deliveries: stream::iter(deliveries).boxed(),
        };

        updater
            .spawn(subscription, CancellationToken::new())
            .await
            .expect("updater task");

        assert_eq!(acks.load(Ordering::SeqCst), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_friend_publishes_the_users_fresh_feed() {
        let broker = MemoryBroker::new();
        let repos = Arc::new(InMemoryRepositories::new());
        let updater = updater(repos.clone(), &broker);
        let (user, friend) = (UserId::new(), UserId::new());
        repos.add_friend(user, friend).await.expect("befriend");
        let now = OffsetDateTime::now_utc();
        let post = repos
            .create_post(Post {
                id: PostId::new(),
                author_user_id: friend,
                text: "hi".into(),
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("post");

        let mut watch = broker
            .consume(ConsumerSpec {
                queue: "watch".into(),
                tag: "watch".into(),
                routing_key: topics().routing_key(user),
                durable: false,
            })
            .await
            .expect("consume");

        updater
            .dispatch(DomainEvent::FriendAdded {
                user_id: user,
                friend_id: friend,
            })
            .await
            .expect("dispatch");

        let delivery = watch.deliveries.next().await.expect("update");
        let update: FeedUpdate = serde_json::from_slice(&delivery.body).expect("decode");
        assert_eq!(update.user_id, user);
        assert_eq!(update.posts, vec![post]);
    }
}
