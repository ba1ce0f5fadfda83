//! In-process broker with durable-consumer semantics.
//!
//! Mirrors the contract the pipeline relies on from JetStream: per-subject
//! append-only log, named consumer cursors, redelivery on nak, and a
//! `max_deliver` cap after which a message is no longer handed out.
//! Volatile and single-process; meant for development and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Broker, BrokerConsumer, BrokerError, BrokerMessage, MessageAck};

#[derive(Default)]
struct ConsumerCursor {
    /// Next unread position in the subject log.
    next: usize,
    /// Nak'd messages awaiting redelivery, with their redelivery count.
    redeliveries: VecDeque<(Arc<Vec<u8>>, u32)>,
    /// Total deliveries allowed per message; <= 0 is unlimited.
    max_deliver: i64,
}

#[derive(Default)]
struct SubjectState {
    log: Vec<Arc<Vec<u8>>>,
    consumers: HashMap<String, ConsumerCursor>,
}

#[derive(Default)]
struct Inner {
    subjects: Mutex<HashMap<String, SubjectState>>,
    published: Notify,
}

/// In-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages ever published to a subject. Test helper.
    pub fn published_count(&self, subject: &str) -> usize {
        let subjects = self.inner.subjects.lock().unwrap();
        subjects.get(subject).map(|s| s.log.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError> {
        {
            let mut subjects = self.inner.subjects.lock().unwrap();
            subjects
                .entry(subject.to_string())
                .or_default()
                .log
                .push(Arc::new(payload.to_vec()));
        }
        self.inner.published.notify_waiters();
        Ok(())
    }

    async fn consumer(
        &self,
        subject: &str,
        durable: &str,
        max_deliver: i64,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let mut subjects = self.inner.subjects.lock().unwrap();
        let state = subjects.entry(subject.to_string()).or_default();
        state
            .consumers
            .entry(durable.to_string())
            .or_insert_with(|| ConsumerCursor {
                next: 0,
                redeliveries: VecDeque::new(),
                max_deliver,
            });

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            subject: subject.to_string(),
            durable: durable.to_string(),
        }))
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    subject: String,
    durable: String,
}

impl MemoryConsumer {
    fn drain(&self, batch: usize) -> Vec<BrokerMessage> {
        let mut subjects = self.inner.subjects.lock().unwrap();
        let Some(state) = subjects.get_mut(&self.subject) else {
            return Vec::new();
        };
        let SubjectState { log, consumers } = state;
        let Some(cursor) = consumers.get_mut(&self.durable) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        while out.len() < batch {
            let (payload, redeliveries) = if let Some(entry) = cursor.redeliveries.pop_front() {
                entry
            } else if cursor.next < log.len() {
                let payload = log[cursor.next].clone();
                cursor.next += 1;
                (payload, 0)
            } else {
                break;
            };

            out.push(BrokerMessage::new(
                self.subject.clone(),
                payload.as_ref().clone(),
                redeliveries,
                Box::new(MemoryAck {
                    inner: self.inner.clone(),
                    subject: self.subject.clone(),
                    durable: self.durable.clone(),
                    payload,
                    redeliveries,
                }),
            ));
        }
        out
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn fetch(
        &mut self,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let deadline = Instant::now() + expires;

        loop {
            // Register interest before checking, so a publish between the
            // check and the wait cannot be missed.
            let published = self.inner.published.notified();

            let messages = self.drain(batch);
            if !messages.is_empty() {
                return Ok(messages);
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = published => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }
}

struct MemoryAck {
    inner: Arc<Inner>,
    subject: String,
    durable: String,
    payload: Arc<Vec<u8>>,
    redeliveries: u32,
}

#[async_trait]
impl MessageAck for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn nak(self: Box<Self>) -> Result<(), BrokerError> {
        let MemoryAck {
            inner,
            subject,
            durable,
            payload,
            redeliveries,
        } = *self;
        {
            let mut subjects = inner.subjects.lock().unwrap();
            let cursor = subjects
                .get_mut(&subject)
                .and_then(|s| s.consumers.get_mut(&durable))
                .ok_or_else(|| BrokerError::Ack("consumer cursor gone".to_string()))?;

            // Delivery numbers are 1-based; a message nak'd at its final
            // allowed delivery is dropped, as JetStream does at max_deliver.
            let next_delivery = i64::from(redeliveries) + 2;
            if cursor.max_deliver <= 0 || next_delivery <= cursor.max_deliver {
                cursor.redeliveries.push_back((payload, redeliveries + 1));
            }
        }
        inner.published.notify_waiters();
        Ok(())
    }
}
