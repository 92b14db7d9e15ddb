use std::sync::Arc;

use kinfeed_api_types::{Post, PostId, UserId};
use time::OffsetDateTime;
use tracing::warn;

use crate::application::error::AppError;
use crate::application::repos::PostsRepo;
use crate::feed::NotificationPublisher;

const MAX_POST_LEN: usize = 4096;

/// Post writes. Each successful write is announced to the feed updater;
/// a failed announcement is logged and does not fail the write.
pub struct PostService {
    repo: Arc<dyn PostsRepo>,
    notifier: Arc<NotificationPublisher>,
}

impl PostService {
    pub fn new(repo: Arc<dyn PostsRepo>, notifier: Arc<NotificationPublisher>) -> Self {
        Self { repo, notifier }
    }

    pub async fn create(&self, author: UserId, text: String) -> Result<Post, AppError> {
        let text = validate_text(text)?;
        let now = OffsetDateTime::now_utc();
        let post = self
            .repo
            .create_post(Post {
                id: PostId::new(),
                author_user_id: author,
                text,
                created_at: now,
                updated_at: now,
            })
            .await?;

        if let Err(err) = self.notifier.notify_create_post(author, post.clone()).await {
            warn!(user_id = %author, post_id = %post.id, error = %err, "Failed to announce new post");
        }
        Ok(post)
    }

    pub async fn update(&self, author: UserId, id: PostId, text: String) -> Result<Post, AppError> {
        let text = validate_text(text)?;
        let post = self
            .repo
            .update_post(author, id, text, OffsetDateTime::now_utc())
            .await?;

        if let Err(err) = self.notifier.notify_update_post(author, post.clone()).await {
            warn!(user_id = %author, post_id = %id, error = %err, "Failed to announce post update");
        }
        Ok(post)
    }

    pub async fn delete(&self, author: UserId, id: PostId) -> Result<(), AppError> {
        self.repo.delete_post(author, id).await?;

        if let Err(err) = self.notifier.notify_delete_post(author, id).await {
            warn!(user_id = %author, post_id = %id, error = %err, "Failed to announce post deletion");
        }
        Ok(())
    }

    pub async fn get(&self, author: UserId, id: PostId) -> Result<Post, AppError> {
        self.repo.find_post(author, id).await?.ok_or(AppError::NotFound)
    }
}

fn validate_text(text: String) -> Result<String, AppError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("post text must not be empty"));
    }
    if trimmed.chars().count() > MAX_POST_LEN {
        return Err(AppError::validation(format!(
            "post text must not exceed {MAX_POST_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_trimmed_and_checked() {
        assert_eq!(validate_text("  hi \n".into()).expect("valid"), "hi");
        assert!(matches!(
            validate_text("   ".into()),
            Err(AppError::Validation(_))
        ));
        assert!(validate_text("x".repeat(MAX_POST_LEN + 1)).is_err());
    }
}
