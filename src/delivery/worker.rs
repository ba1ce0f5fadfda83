//! Per-channel delivery worker.
//!
//! Per-message protocol:
//!
//! 1. read the broker redelivery count `r` (0 on first attempt)
//! 2. if `r > 0`, sleep the channel's backoff for attempt `r`
//! 3. invoke the transport adapter
//! 4. success: write the audit row, then ack
//! 5. failure: terminal (`r + 1 >= max_retries`) → publish the DLQ entry,
//!    write a failed row, ack; otherwise nak for redelivery
//!
//! Rows are written before the ack so a crash can duplicate a delivery
//! but never lose its audit trail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{Shutdown, ShutdownState};
use crate::broker::{publish_json, subjects, BrokerMessage, SharedBroker};
use crate::cache::{keys, SharedEphemeral};
use crate::config::DeliveryConfig;
use crate::delivery::{CircuitBreaker, Transport};
use crate::event::{Channel, DlqEntry, RenderedNotification};
use crate::store::{Delivery, DeliveryStatus, SharedStore};
use crate::telemetry::counters;

pub struct DeliveryWorker {
    channel: Channel,
    broker: SharedBroker,
    store: SharedStore,
    cache: SharedEphemeral,
    transport: Arc<dyn Transport>,
    config: DeliveryConfig,
    fetch_expires: Duration,
    breaker: CircuitBreaker,
    shutdown: Arc<Shutdown>,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Channel,
        broker: SharedBroker,
        store: SharedStore,
        cache: SharedEphemeral,
        transport: Arc<dyn Transport>,
        config: DeliveryConfig,
        fetch_expires: Duration,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold);
        Self {
            channel,
            broker,
            store,
            cache,
            transport,
            config,
            fetch_expires,
            breaker,
            shutdown,
        }
    }

    /// Run the pull loop until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let subject = subjects::delivery(self.channel);
        let durable = subjects::worker_consumer(self.channel);
        let max_deliver = i64::from(self.config.max_retries);
        let mut consumer = self.broker.consumer(&subject, &durable, max_deliver).await?;

        let channel_config = self.config.channel(self.channel).clone();

        info!(
            channel = %self.channel,
            transport = self.transport.name(),
            max_retries = self.config.max_retries,
            batch = channel_config.batch,
            "delivery worker started"
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow_and_update() != ShutdownState::Running {
                        info!(channel = %self.channel, "delivery worker shutting down");
                        break;
                    }
                }

                batch = consumer.fetch(channel_config.batch, self.fetch_expires) => {
                    match batch {
                        Ok(messages) => {
                            for message in messages {
                                self.process(message).await;
                                self.cooldown_if_open().await;
                            }
                        }
                        Err(e) => {
                            warn!(channel = %self.channel, error = %e, "worker fetch failed");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Open breaker: stop consuming, cool down, close, resume. The next
    /// failure can reopen it immediately.
    async fn cooldown_if_open(&self) {
        if !self.breaker.is_open() {
            return;
        }
        let cooldown = Duration::from_secs(self.config.channel(self.channel).cooldown_secs);
        warn!(
            channel = %self.channel,
            cooldown_secs = cooldown.as_secs(),
            "circuit open, pausing consumption"
        );
        tokio::time::sleep(cooldown).await;
        self.breaker.reset();
    }

    async fn process(&self, message: BrokerMessage) {
        let notification: RenderedNotification = match serde_json::from_slice(&message.payload) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "dropping undecodable notification");
                ack(message).await;
                return;
            }
        };

        let redeliveries = message.redeliveries;
        self.backoff(redeliveries).await;

        let started = Instant::now();
        let outcome = self.transport.send(&notification).await;
        counters::delivery_duration(self.channel, started.elapsed().as_secs_f64());

        match outcome {
            Ok(receipt) => {
                self.handle_success(message, notification, redeliveries, receipt.metadata)
                    .await;
            }
            Err(e) => {
                self.breaker.record_failure();
                self.handle_failure(message, notification, redeliveries, e.to_string())
                    .await;
            }
        }
    }

    /// Backoff before a redelivered attempt. The delay table is indexed
    /// by redelivery count; the last entry repeats.
    async fn backoff(&self, redeliveries: u32) {
        if redeliveries == 0 {
            return;
        }
        let delays = &self.config.channel(self.channel).retry_delays_ms;
        if delays.is_empty() {
            return;
        }
        let index = ((redeliveries - 1) as usize).min(delays.len() - 1);
        let delay = Duration::from_millis(delays[index]);
        debug!(
            channel = %self.channel,
            attempt = redeliveries + 1,
            delay_ms = delays[index],
            "retry backoff"
        );
        tokio::time::sleep(delay).await;
    }

    async fn handle_success(
        &self,
        message: BrokerMessage,
        notification: RenderedNotification,
        redeliveries: u32,
        metadata: serde_json::Value,
    ) {
        let row = Delivery::delivered(
            &notification.user_id,
            self.channel,
            notification.event_type,
            &notification.event_id,
            (redeliveries + 1) as i32,
            metadata,
        );

        // Audit durability: the row lands before the ack.
        if let Err(e) = self.store.insert_delivery(&row).await {
            warn!(
                event_id = %notification.event_id,
                error = %e,
                "delivery row insert failed"
            );
            nak(message).await;
            return;
        }

        self.breaker.record_success();
        counters::delivery(self.channel, DeliveryStatus::Delivered);

        debug!(
            event_id = %notification.event_id,
            channel = %self.channel,
            attempts = redeliveries + 1,
            "notification delivered"
        );

        if self.channel == Channel::InApp {
            self.broadcast(&row, &notification).await;
        }

        ack(message).await;
    }

    async fn handle_failure(
        &self,
        message: BrokerMessage,
        notification: RenderedNotification,
        redeliveries: u32,
        error: String,
    ) {
        let attempt = redeliveries + 1;

        if attempt < self.config.max_retries {
            debug!(
                event_id = %notification.event_id,
                channel = %self.channel,
                attempt,
                error = %error,
                "delivery failed, scheduling redelivery"
            );
            nak(message).await;
            return;
        }

        error!(
            event_id = %notification.event_id,
            channel = %self.channel,
            attempts = attempt,
            error = %error,
            "delivery exhausted retries, moving to DLQ"
        );

        let entry = DlqEntry::new(notification.clone(), error.clone());
        if let Err(e) = publish_json(self.broker.as_ref(), subjects::DLQ, &entry).await {
            warn!(event_id = %notification.event_id, error = %e, "DLQ publish failed");
            nak(message).await;
            return;
        }

        let row = Delivery::failed(
            &notification.user_id,
            self.channel,
            notification.event_type,
            &notification.event_id,
            self.config.max_retries as i32,
            json!({ "transport": self.transport.name() }),
            error,
        );
        if let Err(e) = self.store.insert_delivery(&row).await {
            warn!(
                event_id = %notification.event_id,
                error = %e,
                "failed delivery row insert failed"
            );
            nak(message).await;
            return;
        }

        counters::delivery(self.channel, DeliveryStatus::Failed);
        ack(message).await;
    }

    /// Best-effort broadcast for the real-time fan-out layer. The row is
    /// already durable; a publish failure only logs.
    async fn broadcast(&self, row: &Delivery, notification: &RenderedNotification) {
        let payload = json!({
            "user_id": notification.user_id,
            "notification": {
                "id": row.id,
                "event_id": notification.event_id,
                "event_type": notification.event_type,
                "subject": notification.subject,
                "body": notification.body,
                "priority": notification.priority,
                "created_at": notification.created_at,
            },
        });

        if let Err(e) = self
            .cache
            .publish(keys::BROADCAST, &payload.to_string())
            .await
        {
            warn!(
                event_id = %notification.event_id,
                error = %e,
                "in-app broadcast failed"
            );
        }
    }
}

async fn ack(message: BrokerMessage) {
    if let Err(e) = message.ack().await {
        warn!(error = %e, "ack failed");
    }
}

async fn nak(message: BrokerMessage) {
    if let Err(e) = message.nak().await {
        warn!(error = %e, "nak failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::cache::MemoryEphemeral;
    use crate::config::ChannelDeliveryConfig;
    use crate::delivery::MockTransport;
    use crate::event::{
        ContactSnapshot, EnrichedEvent, EventData, EventType, Priority, RoutedEvent,
        SubmittedEvent,
    };
    use crate::store::{MemoryStore, Store};
    use chrono::Utc;

    fn notification(channel: Channel) -> RenderedNotification {
        let submitted = SubmittedEvent {
            event_id: "e1".into(),
            event_type: EventType::Account,
            user_id: "u1".into(),
            channels: vec![channel],
            priority: Priority::Normal,
            data: EventData::new(),
            scheduled_at: None,
            expires_at: None,
            metadata: None,
            created_at: Utc::now(),
        };
        let enriched = EnrichedEvent::from_submitted(
            submitted,
            Some(ContactSnapshot {
                email: "alice@ex.com".into(),
                phone: Some("+15550100".into()),
                push_tokens: vec!["tok".into()],
            }),
        );
        let routed = RoutedEvent::for_channel(&enriched, channel);
        RenderedNotification::from_routed(&routed, Some("s".into()), "b".into())
    }

    /// Delivery config with no backoff so tests run fast.
    fn fast_config() -> DeliveryConfig {
        let instant = ChannelDeliveryConfig {
            retry_delays_ms: vec![],
            cooldown_secs: 0,
            batch: 5,
        };
        DeliveryConfig {
            max_retries: 3,
            breaker_threshold: 5,
            email: instant.clone(),
            sms: instant.clone(),
            push: instant.clone(),
            in_app: instant,
        }
    }

    struct Harness {
        broker: MemoryBroker,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryEphemeral>,
        shutdown: Arc<Shutdown>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                broker: MemoryBroker::new(),
                store: Arc::new(MemoryStore::new()),
                cache: Arc::new(MemoryEphemeral::new()),
                shutdown: Shutdown::new(),
            }
        }

        async fn run_worker(
            &self,
            channel: Channel,
            transport: Arc<dyn Transport>,
            config: DeliveryConfig,
        ) {
            let worker = DeliveryWorker::new(
                channel,
                Arc::new(self.broker.clone()),
                self.store.clone(),
                self.cache.clone(),
                transport,
                config,
                Duration::from_millis(50),
                self.shutdown.clone(),
            );
            let handle = tokio::spawn(worker.run());
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.shutdown.trigger();
            handle.await.unwrap().unwrap();
        }

        async fn publish(&self, channel: Channel) {
            self.broker
                .publish(
                    &subjects::delivery(channel),
                    &serde_json::to_vec(&notification(channel)).unwrap(),
                )
                .await
                .unwrap();
        }

        async fn dlq_entries(&self) -> Vec<DlqEntry> {
            let mut consumer = self
                .broker
                .consumer(subjects::DLQ, "test-observer", -1)
                .await
                .unwrap();
            consumer
                .fetch(100, Duration::from_millis(100))
                .await
                .unwrap()
                .into_iter()
                .map(|m| serde_json::from_slice(&m.payload).unwrap())
                .collect()
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success_writes_row() {
        let h = Harness::new();
        h.publish(Channel::Email).await;

        let transport = Arc::new(MockTransport::new());
        h.run_worker(Channel::Email, transport.clone(), fast_config())
            .await;

        assert_eq!(transport.sends(), 1);
        let rows = h.store.deliveries_for_event("e1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DeliveryStatus::Delivered);
        assert_eq!(rows[0].attempt_count, 1);
        assert!(h.dlq_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let h = Harness::new();
        h.publish(Channel::Email).await;

        let transport = Arc::new(MockTransport::failing(2));
        h.run_worker(Channel::Email, transport.clone(), fast_config())
            .await;

        assert_eq!(transport.sends(), 3);
        let rows = h.store.deliveries_for_event("e1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DeliveryStatus::Delivered);
        assert_eq!(rows[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let h = Harness::new();
        h.publish(Channel::Email).await;

        // Fails more times than the retry budget allows.
        let transport = Arc::new(MockTransport::failing(4));
        h.run_worker(Channel::Email, transport.clone(), fast_config())
            .await;

        // max_deliver bounds attempts at 3.
        assert_eq!(transport.sends(), 3);

        let rows = h.store.deliveries_for_event("e1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DeliveryStatus::Failed);
        assert_eq!(rows[0].attempt_count, 3);
        assert_eq!(rows[0].error.as_deref(), Some("send failed: scripted failure"));

        let dlq = h.dlq_entries().await;
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].notification.event_id, "e1");
        assert!(dlq[0].error.contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_missing_contact_surfaces_via_dlq() {
        let h = Harness::new();

        // Rendered notification without an email address.
        let mut n = notification(Channel::Email);
        n.user_email = None;
        h.broker
            .publish(
                &subjects::delivery(Channel::Email),
                &serde_json::to_vec(&n).unwrap(),
            )
            .await
            .unwrap();

        h.run_worker(Channel::Email, Arc::new(crate::delivery::EmailTransport), fast_config())
            .await;

        let rows = h.store.deliveries_for_event("e1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DeliveryStatus::Failed);
        assert!(rows[0]
            .error
            .as_deref()
            .unwrap()
            .contains("missing contact field"));
        assert_eq!(h.dlq_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_in_app_broadcasts_after_row() {
        let h = Harness::new();
        let mut rx = h.cache.subscribe();
        h.publish(Channel::InApp).await;

        h.run_worker(Channel::InApp, Arc::new(MockTransport::new()), fast_config())
            .await;

        let broadcast = rx.recv().await.unwrap();
        assert_eq!(broadcast.channel, keys::BROADCAST);

        let payload: serde_json::Value = serde_json::from_str(&broadcast.payload).unwrap();
        assert_eq!(payload["user_id"], "u1");
        assert_eq!(payload["notification"]["event_id"], "e1");
        assert_eq!(payload["notification"]["priority"], "normal");
        assert!(payload["notification"]["id"].is_string());
    }

    #[tokio::test]
    async fn test_breaker_pauses_then_resumes() {
        let h = Harness::new();
        for _ in 0..6 {
            h.publish(Channel::Email).await;
        }

        let mut config = fast_config();
        config.breaker_threshold = 5;

        // Every send fails; after five failures the breaker opens, cools
        // down (zero in tests) and consumption resumes.
        let transport = Arc::new(MockTransport::failing(u32::MAX));
        h.run_worker(Channel::Email, transport.clone(), config).await;

        // All six messages exhausted their budget despite the breaker
        // opening mid-stream.
        assert_eq!(h.dlq_entries().await.len(), 6);
        assert_eq!(h.store.delivery_count(), 6);
    }
}
