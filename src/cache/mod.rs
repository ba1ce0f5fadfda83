//! Ephemeral key/value store: dedup set, sliding rate-limit counters and
//! the in-app broadcast channel.
//!
//! # Implementations
//!
//! - [`MemoryEphemeral`]: single-process, lazily-expiring map. Tests/dev.
//! - [`RedisEphemeral`]: Redis via a managed connection.

mod memory;
mod redis;

pub use memory::MemoryEphemeral;
pub use redis::RedisEphemeral;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{CacheBackend, CacheConfig};
use crate::event::{Channel, EventType};

/// Key and channel naming shared with operational tooling.
pub mod keys {
    use crate::event::{Channel, EventType};

    /// Pub/sub channel observed by the real-time fan-out layer.
    pub const BROADCAST: &str = "ws:notifications";

    pub fn dedup(event_id: &str) -> String {
        format!("dedup:{event_id}")
    }

    pub fn rate_limit(user_id: &str, channel: Channel, event_type: EventType) -> String {
        format!("ratelimit:{user_id}:{channel}:{event_type}")
    }
}

/// Errors from the ephemeral store. Transient: callers nak and let the
/// broker redeliver.
#[derive(Debug, thiserror::Error)]
#[error("ephemeral store error: {0}")]
pub struct EphemeralError(pub String);

/// Ephemeral store seam.
#[async_trait]
pub trait Ephemeral: Send + Sync {
    /// Atomic set-if-absent with TTL. Returns `true` when the key was
    /// absent and is now set; this is the linearization point for dedup.
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, EphemeralError>;

    /// Atomic increment; the key expires `ttl` after its first increment.
    /// Returns the post-increment value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, EphemeralError>;

    /// Remaining TTL, `None` when the key does not exist.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, EphemeralError>;

    /// Current integer value, `None` when absent. Read-only; used by
    /// diagnostics and tests.
    async fn get_counter(&self, key: &str) -> Result<Option<i64>, EphemeralError>;

    /// Fire-and-forget pub/sub publish.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), EphemeralError>;
}

/// Shared ephemeral store handle.
pub type SharedEphemeral = Arc<dyn Ephemeral>;

/// Dedup check for a submitted event: `true` means first sight.
pub async fn dedup_first_seen(
    cache: &dyn Ephemeral,
    event_id: &str,
    ttl: Duration,
) -> Result<bool, EphemeralError> {
    cache.set_nx(&keys::dedup(event_id), ttl).await
}

/// Advance the sliding rate-limit counter for one (user, channel,
/// event type) and return the new count.
pub async fn bump_rate_limit(
    cache: &dyn Ephemeral,
    user_id: &str,
    channel: Channel,
    event_type: EventType,
    ttl: Duration,
) -> Result<i64, EphemeralError> {
    cache
        .incr_with_ttl(&keys::rate_limit(user_id, channel, event_type), ttl)
        .await
}

/// Create an ephemeral backend based on configuration.
pub async fn connect(config: &CacheConfig) -> anyhow::Result<SharedEphemeral> {
    match config.backend {
        CacheBackend::Memory => {
            tracing::info!("using in-memory ephemeral store (volatile)");
            Ok(Arc::new(MemoryEphemeral::new()))
        }
        CacheBackend::Redis => {
            let cache = RedisEphemeral::connect(&config.url).await?;
            tracing::info!(url = %config.url, "connected to redis");
            Ok(Arc::new(cache))
        }
    }
}
