//! Bridges per-user broker channels to live client connections.
//!
//! A user's broker consumer exists exactly while at least one live
//! subscription for that user is open in this process. Consumers are created
//! and stopped under the registry lock so the two never race.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kinfeed_api_types::{FeedUpdate, UserId};
use metrics::gauge;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    Broker, BrokerError, DeliveryStream, Subscription, TopicConsumer,
};

use super::topics::UserTopics;

#[derive(Debug, Error)]
pub enum MultiplexError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("live updates are shutting down")]
    ShutDown,
}

/// One open live connection's view of its owner's updates.
///
/// `receiver` yields `None` once the subscription is removed.
#[derive(Debug)]
pub struct LiveSubscription {
    pub id: Uuid,
    pub user_id: UserId,
    pub receiver: mpsc::Receiver<Arc<FeedUpdate>>,
}

struct UserEntry {
    consumer: Box<dyn TopicConsumer>,
    generation: u64,
    subscriptions: HashMap<Uuid, mpsc::Sender<Arc<FeedUpdate>>>,
}

#[derive(Default)]
struct Registry {
    users: HashMap<UserId, UserEntry>,
    next_generation: u64,
    closed: bool,
}

impl Registry {
    fn record_gauges(&self) {
        let subscriptions: usize = self
            .users
            .values()
            .map(|entry| entry.subscriptions.len())
            .sum();
        gauge!("kinfeed_live_consumers").set(self.users.len() as f64);
        gauge!("kinfeed_live_subscriptions").set(subscriptions as f64);
    }
}

struct Inner {
    broker: Arc<dyn Broker>,
    topics: UserTopics,
    capacity: usize,
    registry: Mutex<Registry>,
}

#[derive(Clone)]
pub struct LiveUpdateMultiplexer {
    inner: Arc<Inner>,
}

impl LiveUpdateMultiplexer {
    pub fn new(broker: Arc<dyn Broker>, topics: UserTopics, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                topics,
                capacity: capacity.max(1),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub async fn subscribe(&self, user: UserId) -> Result<LiveSubscription, MultiplexError> {
        let mut registry = self.inner.registry.lock().await;
        if registry.closed {
            return Err(MultiplexError::ShutDown);
        }

        if !registry.users.contains_key(&user) {
            let spec = self.inner.topics.consumer_spec(user);
            let Subscription {
                consumer,
                deliveries,
            } = self.inner.broker.consume(spec).await?;
            registry.next_generation += 1;
            let generation = registry.next_generation;
            tokio::spawn(pump(Arc::clone(&self.inner), user, generation, deliveries));
            registry.users.insert(
                user,
                UserEntry {
                    consumer,
                    generation,
                    subscriptions: HashMap::new(),
                },
            );
            debug!(user_id = %user, generation, "Live update consumer started");
        }

        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        if let Some(entry) = registry.users.get_mut(&user) {
            entry.subscriptions.insert(id, sender);
        }
        registry.record_gauges();
        debug!(user_id = %user, subscription_id = %id, "Live subscription opened");

        Ok(LiveSubscription {
            id,
            user_id: user,
            receiver,
        })
    }

    /// Closes one subscription. The user's consumer is stopped with the last one.
    pub async fn unsubscribe(&self, user: UserId, id: Uuid) -> Result<(), MultiplexError> {
        let mut registry = self.inner.registry.lock().await;
        let Some(entry) = registry.users.get_mut(&user) else {
            return Ok(());
        };
        if entry.subscriptions.remove(&id).is_none() {
            return Ok(());
        }
        debug!(user_id = %user, subscription_id = %id, "Live subscription closed");

        let last = entry.subscriptions.is_empty();
        let removed = if last { registry.users.remove(&user) } else { None };
        registry.record_gauges();

        if let Some(entry) = removed {
            entry.consumer.stop().await?;
            debug!(user_id = %user, "Live update consumer stopped");
        }
        Ok(())
    }

    /// Stops every consumer and closes every open subscription.
    pub async fn shutdown(&self) {
        let mut registry = self.inner.registry.lock().await;
        registry.closed = true;
        let users: Vec<_> = registry.users.drain().collect();
        registry.record_gauges();

        for (user, entry) in users {
            if let Err(err) = entry.consumer.stop().await {
                warn!(user_id = %user, error = %err, "Failed to stop live update consumer");
            }
        }
        info!("Live update multiplexer shut down");
    }

    pub async fn consumer_count(&self) -> usize {
        self.inner.registry.lock().await.users.len()
    }

    pub async fn subscription_count(&self, user: UserId) -> usize {
        self.inner
            .registry
            .lock()
            .await
            .users
            .get(&user)
            .map_or(0, |entry| entry.subscriptions.len())
    }
}

async fn fan_out(inner: &Inner, user: UserId, generation: u64, update: Arc<FeedUpdate>) {
    let senders: Vec<_> = {
        let registry = inner.registry.lock().await;
        registry
            .users
            .get(&user)
            .filter(|entry| entry.generation == generation)
            .map(|entry| entry.subscriptions.values().cloned().collect())
            .unwrap_or_default()
    };
    for sender in senders {
        // A closed receiver belongs to a connection that is going away.
        let _ = sender.send(Arc::clone(&update)).await;
    }
}

/// Forwards one user's broker messages to that user's live subscriptions.
async fn pump(inner: Arc<Inner>, user: UserId, generation: u64, mut deliveries: DeliveryStream) {
    while let Some(delivery) = deliveries.next().await {
        match serde_json::from_slice::<FeedUpdate>(&delivery.body) {
            Ok(update) => fan_out(&inner, user, generation, Arc::new(update)).await,
            Err(err) => warn!(
                user_id = %user,
                routing_key = delivery.routing_key.as_str(),
                error = %err,
                "Discarding undecodable feed update"
            ),
        }
        if let Err(err) = delivery.ack().await {
            warn!(user_id = %user, error = %err, "Failed to acknowledge feed update");
        }
    }

    let mut registry = inner.registry.lock().await;
    let current = registry
        .users
        .get(&user)
        .is_some_and(|entry| entry.generation == generation);
    if !current {
        return;
    }
    if let Some(entry) = registry.users.remove(&user) {
        registry.record_gauges();
        warn!(
            user_id = %user,
            subscriptions = entry.subscriptions.len(),
            "Live update stream ended, closing subscriptions"
        );
        if let Err(err) = entry.consumer.stop().await {
            warn!(user_id = %user, error = %err, "Failed to stop live update consumer");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::{MemoryBroker, Publisher};

    fn topics() -> UserTopics {
        UserTopics {
            routing_key: "feed.user.{user_id}".into(),
            queue: "feed.user.{user_id}.{instance_id}".into(),
            consumer_tag: "live.{user_id}.{instance_id}".into(),
            instance_id: "test".into(),
        }
    }

    #[tokio::test]
    async fn unknown_subscription_is_a_noop() {
        let broker = MemoryBroker::new();
        let mux = LiveUpdateMultiplexer::new(Arc::new(broker.clone()), topics(), 4);
        let user = UserId::new();

        mux.unsubscribe(user, Uuid::new_v4()).await.expect("no user");
        let sub = mux.subscribe(user).await.expect("subscribe");
        mux.unsubscribe(user, Uuid::new_v4()).await.expect("no id");
        assert_eq!(mux.subscription_count(user).await, 1);
        assert_eq!(broker.queue_count(), 1);
        drop(sub);
    }

    #[tokio::test]
    async fn undecodable_updates_are_skipped() {
        let broker = MemoryBroker::new();
        let mux = LiveUpdateMultiplexer::new(Arc::new(broker.clone()), topics(), 4);
        let user = UserId::new();
        let mut sub = mux.subscribe(user).await.expect("subscribe");
        let key = topics().routing_key(user);

        broker.publish(&key, b"garbage".to_vec()).await.expect("publish");
        let update = FeedUpdate {
            user_id: user,
            posts: Vec::new(),
        };
        broker
            .publish(&key, serde_json::to_vec(&update).expect("encode"))
            .await
            .expect("publish");

        let received = tokio::time::timeout(Duration::from_secs(1), sub.receiver.recv())
            .await
            .expect("delivery in time")
            .expect("open channel");
        assert_eq!(*received, update);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let broker = MemoryBroker::new();
        let mux = LiveUpdateMultiplexer::new(Arc::new(broker.clone()), topics(), 4);
        let mut a = mux.subscribe(UserId::new()).await.expect("a");
        let mut b = mux.subscribe(UserId::new()).await.expect("b");

        mux.shutdown().await;
        assert_eq!(a.receiver.recv().await, None);
        assert_eq!(b.receiver.recv().await, None);
        assert_eq!(broker.queue_count(), 0);
        assert!(matches!(
            mux.subscribe(UserId::new()).await,
            Err(MultiplexError::ShutDown)
        ));
    }
}
