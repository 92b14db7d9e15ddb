use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::{
    Acknowledger, Broker, BrokerError, ConsumerSpec, Delivery, Publisher, Subscription,
    TopicConsumer,
};

const BINDINGS_PREFIX: &str = "kinfeed:bindings:";
const QUEUE_PREFIX: &str = "kinfeed:queue:";
const ROUTING_KEY_FIELD: &str = "routing_key";
const BODY_FIELD: &str = "body";
const NEW_ENTRIES: &str = ">";
const READ_BATCH: usize = 32;
const READ_BLOCK_MS: usize = 1_000;
const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Pending entries idle this long are presumed orphaned by a dead consumer.
const CLAIM_IDLE_MS: usize = 60_000;

fn bindings_key(routing_key: &str) -> String {
    format!("{BINDINGS_PREFIX}{routing_key}")
}

fn stream_key(queue: &str) -> String {
    format!("{QUEUE_PREFIX}{queue}")
}

/// Topic broker on Redis Streams.
///
/// Every queue is a stream read through a consumer group named after the
/// queue, and a per-routing-key set records which queues are bound. Publishing
/// appends to each bound stream, so consumers sharing a queue split its
/// messages while separate queues each get a copy. Entries stay pending until
/// acknowledged, and a consumer replays its own pending entries on start.
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
    client: redis::Client,
    max_len: usize,
}

impl RedisBroker {
    pub fn new(pool: Pool, url: &str, max_len: usize) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|err| BrokerError::Connection(format!("invalid redis url: {err}")))?;
        Ok(Self {
            pool,
            client,
            max_len,
        })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, BrokerError> {
        self.pool
            .get()
            .await
            .map_err(|err| BrokerError::Connection(format!("redis pool: {err}")))
    }
}

fn connection_error(context: &str, err: RedisError) -> BrokerError {
    BrokerError::Connection(format!("{context}: {err}"))
}

#[async_trait]
impl Publisher for RedisBroker {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let publish_error = |message: String| BrokerError::Publish {
            routing_key: routing_key.to_string(),
            message,
        };
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| publish_error(err.to_string()))?;
        let queues: Vec<String> = conn
            .smembers(bindings_key(routing_key))
            .await
            .map_err(|err| publish_error(err.to_string()))?;
        if queues.is_empty() {
            trace!(routing_key, "No queue bound, message dropped");
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for queue in &queues {
            pipe.xadd_maxlen(
                stream_key(queue),
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[
                    (ROUTING_KEY_FIELD, routing_key.as_bytes()),
                    (BODY_FIELD, body.as_slice()),
                ],
            )
            .ignore();
        }
        let (): () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|err| publish_error(err.to_string()))?;
        trace!(routing_key, queues = queues.len(), "Published message");
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn consume(&self, spec: ConsumerSpec) -> Result<Subscription, BrokerError> {
        let stream = stream_key(&spec.queue);
        let group = spec.queue.clone();
        {
            let mut conn = self.conn().await?;
            if !spec.durable {
                // A transient queue left over by a crashed process starts afresh.
                let _: usize = conn
                    .del(&stream)
                    .await
                    .map_err(|err| connection_error("reset queue", err))?;
            }
            // Durable groups start at the head so nothing appended since the
            // binding is skipped.
            let start = if spec.durable { "0" } else { "$" };
            match conn
                .xgroup_create_mkstream::<_, _, _, ()>(&stream, &group, start)
                .await
            {
                Ok(()) => {}
                Err(err) if err.code() == Some("BUSYGROUP") => {}
                Err(err) => return Err(connection_error("create consumer group", err)),
            }
            let _: usize = conn
                .sadd(bindings_key(&spec.routing_key), &spec.queue)
                .await
                .map_err(|err| connection_error("bind queue", err))?;
        }

        let reader = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|err| connection_error("stream connection", err))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let forwarder = tokio::spawn(
            StreamReader {
                conn: reader,
                pool: self.pool.clone(),
                stream: stream.clone(),
                group: group.clone(),
                tag: spec.tag.clone(),
                durable: spec.durable,
                sender,
            }
            .run(shutdown.clone()),
        );

        info!(
            queue = spec.queue.as_str(),
            routing_key = spec.routing_key.as_str(),
            consumer_tag = spec.tag.as_str(),
            durable = spec.durable,
            "Queue bound"
        );

        Ok(Subscription {
            consumer: Box::new(RedisConsumer {
                pool: self.pool.clone(),
                queue: spec.queue,
                stream,
                routing_key: spec.routing_key,
                tag: spec.tag,
                durable: spec.durable,
                shutdown,
                forwarder: Mutex::new(Some(forwarder)),
            }),
            deliveries: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }
}

/// Moves entries from one consumer group into a local channel.
struct StreamReader {
    conn: ConnectionManager,
    pool: Pool,
    stream: String,
    group: String,
    tag: String,
    durable: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl StreamReader {
    async fn run(mut self, shutdown: CancellationToken) {
        if self.durable {
            if let Err(err) = self.claim_orphans().await {
                warn!(consumer_tag = self.tag.as_str(), error = %err, "Could not claim idle entries");
            }
        }

        // An id walks this consumer's pending entries, ">" reads new ones.
        let mut cursor = String::from("0");
        loop {
            let options = StreamReadOptions::default()
                .group(&self.group, &self.tag)
                .count(READ_BATCH)
                .block(READ_BLOCK_MS);
            let keys = [&self.stream];
            let ids = [cursor.as_str()];
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = self.conn.xread_options::<_, _, Option<StreamReadReply>>(
                    &keys,
                    &ids,
                    &options,
                ) => read,
            };

            let entries: Vec<StreamId> = match read {
                Ok(reply) => reply
                    .into_iter()
                    .flat_map(|reply| reply.keys)
                    .flat_map(|key| key.ids)
                    .collect(),
                Err(err) if err.code() == Some("NOGROUP") => {
                    warn!(consumer_tag = self.tag.as_str(), "Queue was deleted by the broker");
                    break;
                }
                Err(err) => {
                    warn!(consumer_tag = self.tag.as_str(), error = %err, "Stream read failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            };

            if cursor != NEW_ENTRIES {
                cursor = match entries.last() {
                    Some(entry) => entry.id.clone(),
                    None => NEW_ENTRIES.to_string(),
                };
            }
            for entry in entries {
                if !self.forward(entry) {
                    return;
                }
            }
        }
        debug!(consumer_tag = self.tag.as_str(), "Stream reader stopped");
    }

    fn forward(&self, entry: StreamId) -> bool {
        let routing_key = entry.get::<String>(ROUTING_KEY_FIELD).unwrap_or_default();
        let body = entry.get::<Vec<u8>>(BODY_FIELD).unwrap_or_default();
        let acker = StreamAck {
            pool: self.pool.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            id: entry.id,
        };
        self.sender
            .send(Delivery::with_acker(routing_key, body, Box::new(acker)))
            .is_ok()
    }

    /// Takes over entries another consumer of the group read but never
    /// acknowledged, so they are replayed with this consumer's own backlog.
    async fn claim_orphans(&mut self) -> Result<(), RedisError> {
        let pending: StreamPendingCountReply = self
            .conn
            .xpending_count(&self.stream, &self.group, "-", "+", READ_BATCH * 8)
            .await?;
        let orphaned: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|entry| entry.consumer != self.tag && entry.last_delivered_ms >= CLAIM_IDLE_MS)
            .map(|entry| entry.id)
            .collect();
        if orphaned.is_empty() {
            return Ok(());
        }
        let claimed: StreamClaimReply = self
            .conn
            .xclaim(&self.stream, &self.group, &self.tag, CLAIM_IDLE_MS, &orphaned)
            .await?;
        info!(
            consumer_tag = self.tag.as_str(),
            claimed = claimed.ids.len(),
            "Claimed idle entries"
        );
        Ok(())
    }
}

struct StreamAck {
    pool: Pool,
    stream: String,
    group: String,
    id: String,
}

#[async_trait]
impl Acknowledger for StreamAck {
    async fn ack(&self) -> Result<(), BrokerError> {
        let ack_error = |message: String| BrokerError::Ack {
            queue: self.group.clone(),
            id: self.id.clone(),
            message,
        };
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| ack_error(err.to_string()))?;
        let _: usize = conn
            .xack(&self.stream, &self.group, &[&self.id])
            .await
            .map_err(|err| ack_error(err.to_string()))?;
        Ok(())
    }
}

struct RedisConsumer {
    pool: Pool,
    queue: String,
    stream: String,
    routing_key: String,
    tag: String,
    durable: bool,
    shutdown: CancellationToken,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl RedisConsumer {
    async fn delete_queue(&self) -> Result<(), RedisError> {
        let mut conn = self.pool.get().await.map_err(|err| {
            RedisError::from((redis::ErrorKind::IoError, "redis pool", err.to_string()))
        })?;
        let (): () = redis::pipe()
            .srem(bindings_key(&self.routing_key), &self.queue)
            .ignore()
            .del(&self.stream)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TopicConsumer for RedisConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.shutdown.cancel();
        let Some(forwarder) = self.forwarder.lock().await.take() else {
            return Ok(());
        };
        let stop_error = |message: String| BrokerError::Stop {
            tag: self.tag.clone(),
            message,
        };
        forwarder.await.map_err(|err| stop_error(err.to_string()))?;
        if !self.durable {
            self.delete_queue()
                .await
                .map_err(|err| stop_error(err.to_string()))?;
            debug!(queue = self.queue.as_str(), consumer_tag = self.tag.as_str(), "Queue deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(bindings_key("feed.events"), "kinfeed:bindings:feed.events");
        assert_eq!(stream_key("feed.user.u.node"), "kinfeed:queue:feed.user.u.node");
    }
}
