use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::cache::lock::mutex_lock;

use super::{
    Broker, BrokerError, ConsumerSpec, Delivery, Publisher, Subscription, TopicConsumer,
};

const SOURCE: &str = "broker::memory";

struct QueueConsumer {
    serial: u64,
    tag: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Queue {
    routing_key: String,
    durable: bool,
    consumers: Vec<QueueConsumer>,
    next: usize,
    backlog: VecDeque<Vec<u8>>,
}

impl Queue {
    /// Hands `body` to the next live consumer in turn, or parks it when the
    /// queue is durable and nobody is attached.
    fn deliver(&mut self, body: Vec<u8>) -> bool {
        while !self.consumers.is_empty() {
            let index = self.next % self.consumers.len();
            let delivery = Delivery::settled(self.routing_key.clone(), body.clone());
            if self.consumers[index].sender.send(delivery).is_ok() {
                self.next = index + 1;
                return true;
            }
            self.consumers.remove(index);
        }
        if self.durable {
            self.backlog.push_back(body);
        }
        false
    }
}

#[derive(Default)]
struct Bindings {
    queues: HashMap<String, Queue>,
    serial: u64,
}

/// In-process broker with exact-match routing keys.
///
/// Each queue buffers without bound, the way a broker-side queue would.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    bindings: Arc<Mutex<Bindings>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        mutex_lock(&self.bindings, SOURCE, "has_queue")
            .queues
            .contains_key(queue)
    }

    pub fn queue_count(&self) -> usize {
        mutex_lock(&self.bindings, SOURCE, "queue_count").queues.len()
    }

    /// Messages parked on a durable queue while it had no consumer.
    pub fn backlog(&self, queue: &str) -> usize {
        mutex_lock(&self.bindings, SOURCE, "backlog")
            .queues
            .get(queue)
            .map_or(0, |queue| queue.backlog.len())
    }

    /// Drops a queue from the broker side, ending its consumers' streams.
    pub fn cancel_queue(&self, queue: &str) -> bool {
        mutex_lock(&self.bindings, SOURCE, "cancel_queue")
            .queues
            .remove(queue)
            .is_some()
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let mut bindings = mutex_lock(&self.bindings, SOURCE, "publish");
        let mut delivered = 0usize;
        for queue in bindings
            .queues
            .values_mut()
            .filter(|queue| queue.routing_key == routing_key)
        {
            if queue.deliver(body.clone()) {
                delivered += 1;
            }
        }
        trace!(routing_key, delivered, "Published message");
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn consume(&self, spec: ConsumerSpec) -> Result<Subscription, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let serial = {
            let mut bindings = mutex_lock(&self.bindings, SOURCE, "consume");
            bindings.serial += 1;
            let serial = bindings.serial;
            let queue = bindings
                .queues
                .entry(spec.queue.clone())
                .or_insert_with(|| Queue {
                    routing_key: spec.routing_key.clone(),
                    durable: spec.durable,
                    consumers: Vec::new(),
                    next: 0,
                    backlog: VecDeque::new(),
                });

            let shared = queue.durable && spec.durable;
            let taken = queue
                .consumers
                .iter()
                .any(|consumer| !shared || consumer.tag == spec.tag);
            if taken || queue.durable != spec.durable {
                return Err(BrokerError::QueueInUse(spec.queue));
            }

            for body in queue.backlog.drain(..) {
                let delivery = Delivery::settled(queue.routing_key.clone(), body);
                // The receiver is still in hand, so this cannot fail.
                let _ = sender.send(delivery);
            }
            queue.consumers.push(QueueConsumer {
                serial,
                tag: spec.tag.clone(),
                sender,
            });
            serial
        };
        debug!(
            queue = spec.queue.as_str(),
            routing_key = spec.routing_key.as_str(),
            consumer_tag = spec.tag.as_str(),
            durable = spec.durable,
            "Queue bound"
        );

        Ok(Subscription {
            consumer: Box::new(MemoryConsumer {
                bindings: Arc::clone(&self.bindings),
                queue: spec.queue,
                tag: spec.tag,
                serial,
            }),
            deliveries: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }
}

struct MemoryConsumer {
    bindings: Arc<Mutex<Bindings>>,
    queue: String,
    tag: String,
    serial: u64,
}

#[async_trait]
impl TopicConsumer for MemoryConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        let mut bindings = mutex_lock(&self.bindings, SOURCE, "stop");
        let Some(queue) = bindings.queues.get_mut(&self.queue) else {
            return Ok(());
        };
        // The queue may since serve a newer consumer under the same tag.
        let before = queue.consumers.len();
        queue
            .consumers
            .retain(|consumer| consumer.serial != self.serial);
        if queue.consumers.len() == before {
            return Ok(());
        }
        if !queue.durable {
            bindings.queues.remove(&self.queue);
            debug!(queue = self.queue.as_str(), consumer_tag = self.tag.as_str(), "Queue deleted");
        }
        Ok(())
    }
}
