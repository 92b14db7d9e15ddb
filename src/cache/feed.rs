//! Typed caches for per-user feeds and follower sets.

use std::sync::Arc;

use kinfeed_api_types::{Post, UserId};

use crate::application::repos::{FeedRepo, FriendsRepo};

use super::backend::CacheBackend;
use super::codec::JsonCodec;
use super::config::CacheConfig;
use super::error::CacheError;
use super::lock::LockProvider;
use super::store::KeyedCacheStore;

pub(crate) fn feed_key(user: UserId) -> String {
    format!("feed:{user}")
}

pub(crate) fn subscribers_key(user: UserId) -> String {
    format!("subscribers:{user}")
}

/// A user's feed, newest first, truncated to `max_len` posts.
pub struct FeedCache {
    store: KeyedCacheStore<Vec<Post>, JsonCodec<Vec<Post>>>,
    repo: Arc<dyn FeedRepo>,
    max_len: usize,
}

impl FeedCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        locks: Arc<dyn LockProvider>,
        config: CacheConfig,
        repo: Arc<dyn FeedRepo>,
        max_len: usize,
    ) -> Self {
        Self {
            store: KeyedCacheStore::new("feed", backend, locks, JsonCodec::new(), config),
            repo,
            max_len,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub async fn get_or_load(&self, user: UserId) -> Result<Vec<Post>, CacheError> {
        self.store
            .get_or_load(&feed_key(user), || {
                self.repo.load_feed_for_user(user, self.max_len, 0)
            })
            .await
    }

    pub async fn load(&self, user: UserId) -> Result<Vec<Post>, CacheError> {
        self.store
            .load(&feed_key(user), || {
                self.repo.load_feed_for_user(user, self.max_len, 0)
            })
            .await
    }

    pub async fn invalidate_all(&self) -> Result<(), CacheError> {
        self.store.invalidate_all().await
    }
}

/// The users following a given user.
pub struct SubscriberCache {
    store: KeyedCacheStore<Vec<UserId>, JsonCodec<Vec<UserId>>>,
    repo: Arc<dyn FriendsRepo>,
}

impl SubscriberCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        locks: Arc<dyn LockProvider>,
        config: CacheConfig,
        repo: Arc<dyn FriendsRepo>,
    ) -> Self {
        Self {
            store: KeyedCacheStore::new("subscribers", backend, locks, JsonCodec::new(), config),
            repo,
        }
    }

    pub async fn get_or_load(&self, user: UserId) -> Result<Vec<UserId>, CacheError> {
        self.store
            .get_or_load(&subscribers_key(user), || self.repo.load_followers_of(user))
            .await
    }

    pub async fn load(&self, user: UserId) -> Result<Vec<UserId>, CacheError> {
        self.store
            .load(&subscribers_key(user), || self.repo.load_followers_of(user))
            .await
    }

    pub async fn invalidate_all(&self) -> Result<(), CacheError> {
        self.store.invalidate_all().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kinfeed_api_types::PostId;
    use time::OffsetDateTime;

    use super::*;
    use crate::application::repos::{FriendsRepo, PostsRepo};
    use crate::cache::backend::MemoryBackend;
    use crate::infra::memory::InMemoryRepositories;

    fn config() -> CacheConfig {
        CacheConfig {
            lock_retry_delay: Duration::from_millis(5),
            ..CacheConfig::default()
        }
    }

    fn post(author: UserId, text: &str, minute: i64) -> Post {
        let at = OffsetDateTime::UNIX_EPOCH + time::Duration::minutes(minute);
        Post {
            id: PostId::new(),
            author_user_id: author,
            text: text.to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn feed_is_truncated_to_max_len() {
        let repos = Arc::new(InMemoryRepositories::new());
        let reader = UserId::new();
        let author = UserId::new();
        repos.add_friend(reader, author).await.expect("friend");
        for minute in 0..5 {
            repos
                .create_post(post(author, "p", minute))
                .await
                .expect("post");
        }

        let backend = Arc::new(MemoryBackend::new());
        let cache = FeedCache::new(backend.clone(), backend, config(), repos, 3);
        let feed = cache.get_or_load(reader).await.expect("feed");
        assert_eq!(feed.len(), 3);
        assert!(feed.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn subscriber_flush_leaves_feeds_alone() {
        let repos = Arc::new(InMemoryRepositories::new());
        let author = UserId::new();
        let follower = UserId::new();
        repos.add_friend(follower, author).await.expect("friend");

        let feed_backend = Arc::new(MemoryBackend::new());
        let subs_backend = Arc::new(MemoryBackend::new());
        let feeds = FeedCache::new(
            feed_backend.clone(),
            feed_backend.clone(),
            config(),
            repos.clone(),
            10,
        );
        let subscribers =
            SubscriberCache::new(subs_backend.clone(), subs_backend, config(), repos);

        feeds.get_or_load(follower).await.expect("feed");
        let followers = subscribers.get_or_load(author).await.expect("followers");
        assert_eq!(followers, vec![follower]);

        subscribers.invalidate_all().await.expect("flush");
        assert_eq!(feed_backend.len(), 1);
    }
}
