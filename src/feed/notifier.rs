//! Publishes domain events for the feed updater.

use std::sync::Arc;

use kinfeed_api_types::{Post, PostId, UserId};
use metrics::counter;
use thiserror::Error;
use tracing::debug;

use crate::broker::{BrokerError, Publisher};
use crate::events::{DomainEvent, EventError};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Encode(#[from] EventError),
    #[error(transparent)]
    Publish(#[from] BrokerError),
}

pub struct NotificationPublisher {
    publisher: Arc<dyn Publisher>,
    routing_key: String,
}

impl NotificationPublisher {
    pub fn new(publisher: Arc<dyn Publisher>, routing_key: impl Into<String>) -> Self {
        Self {
            publisher,
            routing_key: routing_key.into(),
        }
    }

    pub async fn notify_invalidate_all(&self) -> Result<(), NotifyError> {
        self.notify(DomainEvent::InvalidateAll).await
    }

    pub async fn notify_add_friend(
        &self,
        user_id: UserId,
        friend_id: UserId,
    ) -> Result<(), NotifyError> {
        self.notify(DomainEvent::FriendAdded { user_id, friend_id })
            .await
    }

    pub async fn notify_delete_friend(
        &self,
        user_id: UserId,
        friend_id: UserId,
    ) -> Result<(), NotifyError> {
        self.notify(DomainEvent::FriendRemoved { user_id, friend_id })
            .await
    }

    pub async fn notify_create_post(&self, user_id: UserId, post: Post) -> Result<(), NotifyError> {
        self.notify(DomainEvent::PostCreated { user_id, post }).await
    }

    pub async fn notify_update_post(&self, user_id: UserId, post: Post) -> Result<(), NotifyError> {
        self.notify(DomainEvent::PostUpdated { user_id, post }).await
    }

    pub async fn notify_delete_post(
        &self,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<(), NotifyError> {
        self.notify(DomainEvent::PostDeleted { user_id, post_id })
            .await
    }

    async fn notify(&self, event: DomainEvent) -> Result<(), NotifyError> {
        let kind = event.kind();
        let result = self.send(&event).await;
        match &result {
            Ok(()) => debug!(
                event_kind = kind.as_str(),
                routing_key = self.routing_key.as_str(),
                "Published domain event"
            ),
            Err(_) => {
                counter!("kinfeed_notify_failures_total", "kind" => kind.as_str()).increment(1)
            }
        }
        result
    }

    async fn send(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        let body = event.encode()?;
        self.publisher.publish(&self.routing_key, body).await?;
        Ok(())
    }
}
