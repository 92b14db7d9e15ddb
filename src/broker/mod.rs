//! Topic broker abstraction.
//!
//! Messages are published on a routing key and delivered to every queue bound
//! to that key. Within one queue each message goes to exactly one consumer.
//! Consumers are created on demand and stopped explicitly, which lets callers
//! build and tear down per-user topology at runtime.
//!
//! A durable queue outlives its consumers: it keeps buffering while nobody
//! consumes and may be shared by consumers in several processes. A transient
//! queue has a single consumer and is deleted when that consumer stops.

mod memory;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use memory::MemoryBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("publish to `{routing_key}` failed: {message}")]
    Publish {
        routing_key: String,
        message: String,
    },
    #[error("queue `{0}` already has a consumer")]
    QueueInUse(String),
    #[error("consumer `{tag}` did not stop cleanly: {message}")]
    Stop { tag: String, message: String },
    #[error("acknowledging `{id}` on `{queue}` failed: {message}")]
    Ack {
        queue: String,
        id: String,
        message: String,
    },
}

/// Where a new consumer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub queue: String,
    pub tag: String,
    pub routing_key: String,
    pub durable: bool,
}

/// Settles one delivery with the broker once the consumer is done with it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
}

/// One message taken from a queue.
///
/// Deliveries that are never acknowledged stay pending on brokers that track
/// them and are handed out again after a consumer restart.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// A delivery the broker settled when handing it out.
    pub fn settled(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            acker: None,
        }
    }

    pub fn with_acker(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            acker: Some(acker),
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("bytes", &self.body.len())
            .field("acked_on_receipt", &self.acker.is_none())
            .finish()
    }
}

/// Ends when the consumer is stopped or the broker drops it.
pub type DeliveryStream = BoxStream<'static, Delivery>;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait TopicConsumer: Send + Sync {
    fn tag(&self) -> &str;

    /// Cancels the consumer and releases its queue. Calling it twice is harmless.
    async fn stop(&self) -> Result<(), BrokerError>;
}

pub struct Subscription {
    pub consumer: Box<dyn TopicConsumer>,
    pub deliveries: DeliveryStream,
}

#[async_trait]
pub trait Broker: Publisher {
    async fn consume(&self, spec: ConsumerSpec) -> Result<Subscription, BrokerError>;
}
