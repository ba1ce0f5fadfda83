//! Redis ephemeral store backend.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{Ephemeral, EphemeralError};

/// Redis-backed ephemeral store. The connection manager reconnects
/// transparently; individual command failures surface as transient
/// errors.
pub struct RedisEphemeral {
    conn: ConnectionManager,
}

impl RedisEphemeral {
    pub async fn connect(url: &str) -> Result<Self, EphemeralError> {
        let client = redis::Client::open(url).map_err(|e| EphemeralError(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| EphemeralError(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Liveness probe for readiness checks.
    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}

#[async_trait]
impl Ephemeral for RedisEphemeral {
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, EphemeralError> {
        let mut conn = self.conn.clone();
        // SET NX EX is a single atomic command; nil reply means the key
        // already existed.
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| EphemeralError(e.to_string()))?;
        Ok(set.is_some())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, EphemeralError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn
            .incr(key, 1)
            .await
            .map_err(|e| EphemeralError(e.to_string()))?;
        if value == 1 {
            let _: bool = conn
                .expire(key, ttl.as_secs().max(1) as i64)
                .await
                .map_err(|e| EphemeralError(e.to_string()))?;
        }
        Ok(value)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, EphemeralError> {
        let mut conn = self.conn.clone();
        let secs: i64 = conn
            .ttl(key)
            .await
            .map_err(|e| EphemeralError(e.to_string()))?;
        // -2: no key, -1: no expiry set.
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, EphemeralError> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| EphemeralError(e.to_string()))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), EphemeralError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| EphemeralError(e.to_string()))?;
        Ok(())
    }
}
