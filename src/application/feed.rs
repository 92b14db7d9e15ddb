//! Feed reads and cache administration.

use std::sync::Arc;

use kinfeed_api_types::{Post, UserId};
use thiserror::Error;
use tracing::info;

use crate::cache::{CacheError, FeedCache};
use crate::feed::{NotificationPublisher, NotifyError};

#[derive(Debug, Error)]
pub enum FeedServiceError {
    #[error("offset {offset} + limit {limit} exceeds the maximum feed length {max}")]
    InvalidRange {
        offset: usize,
        limit: usize,
        max: usize,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

pub struct FeedService {
    feeds: Arc<FeedCache>,
    notifier: Arc<NotificationPublisher>,
}

impl FeedService {
    pub fn new(feeds: Arc<FeedCache>, notifier: Arc<NotificationPublisher>) -> Self {
        Self { feeds, notifier }
    }

    /// Returns `limit` posts of `user`'s feed starting at `offset`.
    ///
    /// Only the first `max_len` posts of a feed are kept, so windows reaching
    /// past that are rejected instead of silently truncated.
    pub async fn get_user_feed(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Post>, FeedServiceError> {
        let max = self.feeds.max_len();
        if offset.saturating_add(limit) > max {
            return Err(FeedServiceError::InvalidRange { offset, limit, max });
        }

        let posts = self.feeds.get_or_load(user).await?;
        Ok(posts.into_iter().skip(offset).take(limit).collect())
    }

    /// Asks the feed updater to flush the shared feed and subscriber caches.
    pub async fn invalidate_all(&self) -> Result<(), FeedServiceError> {
        self.notifier.notify_invalidate_all().await?;
        info!("Requested cache invalidation");
        Ok(())
    }
}
