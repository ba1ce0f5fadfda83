//! Broker abstraction carrying events between pipeline stages.
//!
//! Subjects are durable: a named consumer keeps its cursor across
//! restarts, and multiple processes sharing a durable name load-balance
//! messages. Consumers ack explicitly; a nak (or an ack timeout) triggers
//! redelivery, bounded by `max_deliver`.
//!
//! # Implementations
//!
//! - [`MemoryBroker`]: single-process, volatile. Development and tests.
//! - [`JetStreamBroker`]: NATS JetStream, file storage, 24 h retention.

mod jetstream;
mod memory;

pub use jetstream::JetStreamBroker;
pub use memory::MemoryBroker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BrokerBackend, BrokerConfig};

/// Subject and durable-consumer naming. One place, so stage wiring and
/// operational tooling never drift.
pub mod subjects {
    use crate::event::Channel;

    /// Raw submitted events (published by the HTTP layer).
    pub const EVENTS: &str = "notifications.events";

    /// Enriched events (published by ingestion).
    pub const ENRICHED: &str = "notifications.enriched";

    /// Payloads that exhausted their retry budget.
    pub const DLQ: &str = "notifications.dlq";

    /// All pipeline subjects live under this wildcard.
    pub const WILDCARD: &str = "notifications.>";

    pub const INGESTION_CONSUMER: &str = "ingestion-consumer";
    pub const PREFERENCES_CONSUMER: &str = "preferences-consumer";

    /// Per-channel routed events (published by the preference filter).
    pub fn routed(channel: Channel) -> String {
        format!("notifications.routed.{channel}")
    }

    /// Per-channel rendered notifications (published by the renderer).
    pub fn delivery(channel: Channel) -> String {
        format!("notifications.delivery.{channel}")
    }

    pub fn router_consumer(channel: Channel) -> String {
        format!("router-{channel}-consumer")
    }

    pub fn worker_consumer(channel: Channel) -> String {
        format!("{channel}-worker-consumer")
    }
}

/// Errors from broker operations. All of them are transient from the
/// pipeline's point of view: the message is nak'd (or left unacked) and
/// redelivered.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("consumer setup failed: {0}")]
    Consumer(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("ack failed: {0}")]
    Ack(String),
}

/// A message pulled from a subject. Must be either acked (done, success
/// or terminal failure) or nak'd (retryable failure); never both.
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Redelivery count: 0 on first delivery.
    pub redeliveries: u32,
    acker: Box<dyn MessageAck>,
}

impl BrokerMessage {
    pub fn new(
        subject: String,
        payload: Vec<u8>,
        redeliveries: u32,
        acker: Box<dyn MessageAck>,
    ) -> Self {
        Self {
            subject,
            payload,
            redeliveries,
            acker,
        }
    }

    /// Remove the message from the subject.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Request redelivery.
    pub async fn nak(self) -> Result<(), BrokerError> {
        self.acker.nak().await
    }
}

impl std::fmt::Debug for BrokerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("redeliveries", &self.redeliveries)
            .finish()
    }
}

/// Backend-specific ack handle.
#[async_trait]
pub trait MessageAck: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
    async fn nak(self: Box<Self>) -> Result<(), BrokerError>;
}

/// Durable pull consumer bound to one subject.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Pull up to `batch` messages, waiting at most `expires` when the
    /// subject is empty. An empty result is normal.
    async fn fetch(
        &mut self,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError>;
}

/// Broker seam. Publish is safe from any task; consumers are created once
/// per stage and polled from that stage's loop.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Create (or attach to) a durable consumer. `max_deliver <= 0` means
    /// unlimited deliveries.
    async fn consumer(
        &self,
        subject: &str,
        durable: &str,
        max_deliver: i64,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}

/// Shared broker handle.
pub type SharedBroker = Arc<dyn Broker>;

/// Create a broker backend based on configuration.
pub async fn connect(config: &BrokerConfig) -> anyhow::Result<SharedBroker> {
    match config.backend {
        BrokerBackend::Memory => {
            tracing::info!("using in-memory broker (volatile, single process)");
            Ok(Arc::new(MemoryBroker::new()))
        }
        BrokerBackend::Nats => {
            let broker = JetStreamBroker::connect(config).await?;
            tracing::info!(url = %config.url, stream = %config.stream, "connected to JetStream");
            Ok(Arc::new(broker))
        }
    }
}

/// Serialize and publish a pipeline value.
pub async fn publish_json<T: serde::Serialize>(
    broker: &dyn Broker,
    subject: &str,
    value: &T,
) -> Result<(), BrokerError> {
    let payload = serde_json::to_vec(value).map_err(|e| BrokerError::Publish {
        subject: subject.to_string(),
        reason: e.to_string(),
    })?;
    broker.publish(subject, &payload).await
}
