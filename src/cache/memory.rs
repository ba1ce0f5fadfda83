//! In-process ephemeral store with lazy expiry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{Ephemeral, EphemeralError};

struct Entry {
    value: i64,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// A broadcast message observed on the memory pub/sub.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub channel: String,
    pub payload: String,
}

/// In-memory ephemeral store.
pub struct MemoryEphemeral {
    entries: Mutex<HashMap<String, Entry>>,
    broadcasts: broadcast::Sender<Broadcast>,
}

impl MemoryEphemeral {
    pub fn new() -> Self {
        let (broadcasts, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            broadcasts,
        }
    }

    /// Observe pub/sub publishes. Test/dev stand-in for a real
    /// subscriber connection.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.broadcasts.subscribe()
    }
}

impl Default for MemoryEphemeral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ephemeral for MemoryEphemeral {
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, EphemeralError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.live(now) => Ok(false),
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: 1,
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, EphemeralError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) if entry.live(now) => {
                entry.value += 1;
                Ok(entry.value)
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: 1,
                        expires_at: now + ttl,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, EphemeralError> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.expires_at - now))
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, EphemeralError> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).filter(|e| e.live(now)).map(|e| e.value))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), EphemeralError> {
        // No subscribers is fine; pub/sub is fire-and-forget.
        let _ = self.broadcasts.send(Broadcast {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_detects_duplicates() {
        let cache = MemoryEphemeral::new();
        let ttl = Duration::from_secs(60);

        assert!(cache.set_nx("dedup:e1", ttl).await.unwrap());
        assert!(!cache.set_nx("dedup:e1", ttl).await.unwrap());
        assert!(cache.set_nx("dedup:e2", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_after_expiry() {
        let cache = MemoryEphemeral::new();
        let ttl = Duration::from_secs(10);

        assert!(cache.set_nx("k", ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.set_nx("k", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_sets_ttl_once() {
        let cache = MemoryEphemeral::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(cache.incr_with_ttl("c", ttl).await.unwrap(), 1);
        assert_eq!(cache.incr_with_ttl("c", ttl).await.unwrap(), 2);
        assert_eq!(cache.incr_with_ttl("c", ttl).await.unwrap(), 3);
        assert_eq!(cache.get_counter("c").await.unwrap(), Some(3));
        assert!(cache.ttl("c").await.unwrap().unwrap() <= ttl);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_window_resets() {
        let cache = MemoryEphemeral::new();
        let ttl = Duration::from_secs(30);

        assert_eq!(cache.incr_with_ttl("c", ttl).await.unwrap(), 1);
        assert_eq!(cache.incr_with_ttl("c", ttl).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.incr_with_ttl("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let cache = MemoryEphemeral::new();
        let mut rx = cache.subscribe();

        cache.publish("ws:notifications", r#"{"user_id":"u1"}"#).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "ws:notifications");
        assert!(msg.payload.contains("u1"));
    }

    #[tokio::test]
    async fn test_missing_key_reads() {
        let cache = MemoryEphemeral::new();
        assert_eq!(cache.get_counter("absent").await.unwrap(), None);
        assert_eq!(cache.ttl("absent").await.unwrap(), None);
    }
}
