//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use kinfeed_api_types::{Post, PostId, UserId};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Read side used to recompute cached feeds.
#[async_trait]
pub trait FeedRepo: Send + Sync {
    /// Posts written by everyone `user` has befriended, newest first.
    async fn load_feed_for_user(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Post>, RepoError>;
}

#[async_trait]
pub trait FriendsRepo: Send + Sync {
    /// Users that have `user` as a friend and therefore see their posts.
    async fn load_followers_of(&self, user: UserId) -> Result<Vec<UserId>, RepoError>;

    async fn add_friend(&self, user: UserId, friend: UserId) -> Result<(), RepoError>;

    async fn delete_friend(&self, user: UserId, friend: UserId) -> Result<(), RepoError>;
}

#[async_trait]
pub trait PostsRepo: Send + Sync {
    async fn create_post(&self, post: Post) -> Result<Post, RepoError>;

    /// Replaces the text of a post owned by `author`.
    async fn update_post(
        &self,
        author: UserId,
        id: PostId,
        text: String,
        updated_at: OffsetDateTime,
    ) -> Result<Post, RepoError>;

    async fn delete_post(&self, author: UserId, id: PostId) -> Result<(), RepoError>;

    async fn find_post(&self, author: UserId, id: PostId) -> Result<Option<Post>, RepoError>;
}
