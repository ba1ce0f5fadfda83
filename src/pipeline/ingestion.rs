//! Ingestion stage.
//!
//! Consumes raw submitted events, validates, deduplicates within the TTL
//! window, enriches with recipient contact data and publishes enriched
//! events. Poison messages (decode/validation failures) are acked and
//! dropped so the primary stream never loops on them; infrastructure
//! errors nak for redelivery.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bootstrap::{Shutdown, ShutdownState};
use crate::broker::{publish_json, subjects, BrokerMessage, SharedBroker};
use crate::cache::{dedup_first_seen, SharedEphemeral};
use crate::config::PipelineConfig;
use crate::event::{ContactSnapshot, EnrichedEvent, SubmittedEvent};
use crate::store::SharedStore;
use crate::telemetry::counters;

pub struct IngestionStage {
    broker: SharedBroker,
    store: SharedStore,
    cache: SharedEphemeral,
    config: PipelineConfig,
    shutdown: Arc<Shutdown>,
}

impl IngestionStage {
    pub fn new(
        broker: SharedBroker,
        store: SharedStore,
        cache: SharedEphemeral,
        config: PipelineConfig,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            broker,
            store,
            cache,
            config,
            shutdown,
        }
    }

    /// Run the pull loop until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut consumer = self
            .broker
            .consumer(subjects::EVENTS, subjects::INGESTION_CONSUMER, -1)
            .await?;

        info!(
            batch = self.config.ingestion_batch,
            dedup_ttl_secs = self.config.dedup_ttl_secs,
            "ingestion stage started"
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow_and_update() != ShutdownState::Running {
                        info!("ingestion stage shutting down");
                        break;
                    }
                }

                batch = consumer.fetch(self.config.ingestion_batch, self.config.fetch_expires()) => {
                    match batch {
                        Ok(messages) => {
                            for message in messages {
                                self.process(message).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "ingestion fetch failed");
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn process(&self, message: BrokerMessage) {
        // Step 1: decode. A payload that does not decode is poison; drop
        // it from the primary stream.
        let event: SubmittedEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping undecodable event");
                counters::event_failed("unknown", "validation");
                ack(message).await;
                return;
            }
        };

        counters::event_received(event.event_type);

        // Step 2: schema validation.
        if let Err(e) = event.validate() {
            warn!(event_id = %event.event_id, error = %e, "dropping invalid event");
            counters::event_failed(event.event_type.as_str(), "validation");
            ack(message).await;
            return;
        }

        // Already past its validity window; workers would only DLQ it.
        if event.is_expired(Utc::now()) {
            info!(event_id = %event.event_id, "dropping expired event");
            counters::event_failed(event.event_type.as_str(), "expired");
            ack(message).await;
            return;
        }

        // Step 3: dedup. set-if-absent is the linearization point; a
        // redelivered or duplicate submission lands here and is dropped.
        match dedup_first_seen(self.cache.as_ref(), &event.event_id, self.config.dedup_ttl()).await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(event_id = %event.event_id, "duplicate event discarded");
                counters::duplicate(event.event_type);
                ack(message).await;
                return;
            }
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "dedup check failed");
                nak(message).await;
                return;
            }
        }

        // Step 4: enrich. A missing user is not an error: the event
        // proceeds without contact fields and channels that need them
        // surface the failure via the DLQ.
        let contact = match self.store.get_user(&event.user_id).await {
            Ok(Some(user)) => Some(ContactSnapshot {
                email: user.email,
                phone: user.phone,
                push_tokens: user.push_tokens,
            }),
            Ok(None) => {
                debug!(
                    event_id = %event.event_id,
                    user_id = %event.user_id,
                    "user not found, enriching without contact fields"
                );
                None
            }
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "user lookup failed");
                nak(message).await;
                return;
            }
        };

        let event_type = event.event_type;
        let event_id = event.event_id.clone();
        let enriched = EnrichedEvent::from_submitted(event, contact);

        // Step 5: publish, then ack. If the ack is lost the redelivery
        // is caught by the dedup window.
        match publish_json(self.broker.as_ref(), subjects::ENRICHED, &enriched).await {
            Ok(()) => {
                debug!(event_id = %event_id, "event enriched");
                counters::event_processed(event_type);
                ack(message).await;
            }
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "enriched publish failed");
                nak(message).await;
            }
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
