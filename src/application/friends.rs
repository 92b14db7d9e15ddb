use std::sync::Arc;

use kinfeed_api_types::UserId;
use tracing::warn;

use crate::application::error::AppError;
use crate::application::repos::FriendsRepo;
use crate::feed::NotificationPublisher;

pub struct FriendService {
    repo: Arc<dyn FriendsRepo>,
    notifier: Arc<NotificationPublisher>,
}

impl FriendService {
    pub fn new(repo: Arc<dyn FriendsRepo>, notifier: Arc<NotificationPublisher>) -> Self {
        Self { repo, notifier }
    }

    /// `user` starts seeing `friend`'s posts.
    pub async fn add(&self, user: UserId, friend: UserId) -> Result<(), AppError> {
        if user == friend {
            return Err(AppError::validation("cannot befriend yourself"));
        }
        self.repo.add_friend(user, friend).await?;

        if let Err(err) = self.notifier.notify_add_friend(user, friend).await {
            warn!(user_id = %user, friend_id = %friend, error = %err, "Failed to announce new friend");
        }
        Ok(())
    }

    pub async fn delete(&self, user: UserId, friend: UserId) -> Result<(), AppError> {
        self.repo.delete_friend(user, friend).await?;

        if let Err(err) = self.notifier.notify_delete_friend(user, friend).await {
            warn!(user_id = %user, friend_id = %friend, error = %err, "Failed to announce removed friend");
        }
        Ok(())
    }
}
