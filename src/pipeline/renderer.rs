//! Renderer stage, one instance per channel.
//!
//! Loads the (channel, event type) template, substitutes variables and
//! publishes the wire-ready notification to the channel's delivery
//! subject. When no template exists a fallback is synthesized unless
//! disabled by configuration. A dedicated consumer per channel keeps a
//! slow channel from blocking the others.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bootstrap::{Shutdown, ShutdownState};
use crate::broker::{publish_json, subjects, BrokerMessage, SharedBroker};
use crate::config::PipelineConfig;
use crate::event::{Channel, RenderedNotification, RoutedEvent};
use crate::pipeline::template;
use crate::store::SharedStore;
use crate::telemetry::counters;

pub struct RenderStage {
    channel: Channel,
    broker: SharedBroker,
    store: SharedStore,
    config: PipelineConfig,
    shutdown: Arc<Shutdown>,
}

impl RenderStage {
    pub fn new(
        channel: Channel,
        broker: SharedBroker,
        store: SharedStore,
        config: PipelineConfig,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            channel,
            broker,
            store,
            config,
            shutdown,
        }
    }

    /// Run the pull loop until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let subject = subjects::routed(self.channel);
        let durable = subjects::router_consumer(self.channel);
        let mut consumer = self.broker.consumer(&subject, &durable, -1).await?;

        info!(channel = %self.channel, batch = self.config.renderer_batch, "renderer started");

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow_and_update() != ShutdownState::Running {
                        info!(channel = %self.channel, "renderer shutting down");
                        break;
                    }
                }

                batch = consumer.fetch(self.config.renderer_batch, self.config.fetch_expires()) => {
                    match batch {
                        Ok(messages) => {
                            for message in messages {
                                self.process(message).await;
                            }
                        }
                        Err(e) => {
                            warn!(channel = %self.channel, error = %e, "renderer fetch failed");
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn process(&self, message: BrokerMessage) {
        let event: RoutedEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "dropping undecodable routed event");
                ack(message).await;
                return;
            }
        };

        let loaded = match self
            .store
            .get_template(self.channel, event.event_type)
            .await
        {
            Ok(template) => template,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "template lookup failed");
                nak(message).await;
                return;
            }
        };

        let rendered_body = match &loaded {
            Some(template) => template::render(template, &event),
            None if self.config.disable_template_fallback => {
                warn!(
                    event_id = %event.event_id,
                    channel = %self.channel,
                    event_type = %event.event_type,
                    "no template and fallback disabled, dropping"
                );
                counters::event_failed(event.event_type.as_str(), "no_template");
                ack(message).await;
                return;
            }
            None => {
                debug!(
                    event_id = %event.event_id,
                    channel = %self.channel,
                    event_type = %event.event_type,
                    "no template, using fallback"
                );
                template::fallback(&event)
            }
        };

        let rendered =
            RenderedNotification::from_routed(&event, rendered_body.subject, rendered_body.body);

        match publish_json(
            self.broker.as_ref(),
            &subjects::delivery(self.channel),
            &rendered,
        )
        .await
        {
            Ok(()) => {
                debug!(event_id = %event.event_id, channel = %self.channel, "notification rendered");
                ack(message).await;
            }
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "rendered publish failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::event::{EnrichedEvent, EventData, EventType, Priority, SubmittedEvent};
    use crate::store::{MemoryStore, Store, Template};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn routed_event(data: EventData) -> RoutedEvent {
        let submitted = SubmittedEvent {
            event_id: "e1".into(),
            event_type: EventType::Account,
            user_id: "u1".into(),
            channels: vec![Channel::Email],
            priority: Priority::Normal,
            data,
            scheduled_at: None,
            expires_at: None,
            metadata: None,
            created_at: Utc::now(),
        };
        let enriched = EnrichedEvent::from_submitted(submitted, None);
        RoutedEvent::for_channel(&enriched, Channel::Email)
    }

    async fn run_renderer(
        broker: &MemoryBroker,
        store: Arc<MemoryStore>,
        config: PipelineConfig,
        event: &RoutedEvent,
    ) -> Vec<RenderedNotification> {
        broker
            .publish(
                &subjects::routed(Channel::Email),
                &serde_json::to_vec(event).unwrap(),
            )
            .await
            .unwrap();

        let shutdown = Shutdown::new();
        let stage = RenderStage::new(
            Channel::Email,
            Arc::new(broker.clone()),
            store,
            config,
            shutdown.clone(),
        );
        let handle = tokio::spawn(stage.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.trigger();
        handle.await.unwrap().unwrap();

        let mut consumer = broker
            .consumer(&subjects::delivery(Channel::Email), "test-observer", -1)
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

    #[tokio::test]
    async fn test_renders_with_template() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_template(
                &Template::new(Channel::Email, EventType::Account, "Hello {{name}}")
                    .with_subject("Re: {{name}}")
                    .with_variables(vec!["name".into()]),
            )
            .await
            .unwrap();

        let event = routed_event([("name".to_string(), json!("Ada"))].into_iter().collect());
        let config = PipelineConfig {
            fetch_expires_ms: 50,
            ..Default::default()
        };
        let rendered = run_renderer(&broker, store, config, &event).await;

        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].subject.as_deref(), Some("Re: Ada"));
        assert_eq!(rendered[0].body, "Hello Ada");
        assert_eq!(rendered[0].event_id, "e1");
    }

    #[tokio::test]
    async fn test_missing_template_uses_fallback() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        let event = routed_event([("k".to_string(), json!("v"))].into_iter().collect());
        let config = PipelineConfig {
            fetch_expires_ms: 50,
            ..Default::default()
        };
        let rendered = run_renderer(&broker, store, config, &event).await;

        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].subject.as_deref(), Some("Notification: account"));
        assert_eq!(rendered[0].body, r#"{"k":"v"}"#);
    }

    #[tokio::test]
    async fn test_fallback_disabled_drops_message() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        let event = routed_event(EventData::new());
        let config = PipelineConfig {
            fetch_expires_ms: 50,
            disable_template_fallback: true,
            ..Default::default()
        };
        let rendered = run_renderer(&broker, store, config, &event).await;
        assert!(rendered.is_empty());
    }
}
