//! NATS JetStream broker backend.
//!
//! One file-storage stream (`notifications.>`, 24 h max age by default)
//! carries every pipeline subject. Stages attach durable pull consumers
//! filtered to their subject; the broker serializes which replica of a
//! stage receives each message.

use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use futures::StreamExt;

use super::{subjects, Broker, BrokerConsumer, BrokerError, BrokerMessage, MessageAck};
use crate::config::BrokerConfig;

/// JetStream-backed broker.
pub struct JetStreamBroker {
    context: jetstream::Context,
    stream: String,
}

impl JetStreamBroker {
    /// Connect and ensure the stream exists.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let context = jetstream::new(client);

        context
            .get_or_create_stream(stream::Config {
                name: config.stream.clone(),
                subjects: vec![subjects::WILDCARD.to_string()],
                storage: stream::StorageType::File,
                max_age: Duration::from_secs(config.max_age_hours * 3600),
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            context,
            stream: config.stream.clone(),
        })
    }
}

#[async_trait]
impl Broker for JetStreamBroker {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let ack = self
            .context
            .publish(subject.to_string(), payload.to_vec().into())
            .await
            .map_err(|e| BrokerError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;

        // Wait for the stream-level ack so a crash after publish cannot
        // lose the message.
        ack.await.map_err(|e| BrokerError::Publish {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn consumer(
        &self,
        subject: &str,
        durable: &str,
        max_deliver: i64,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let stream = self
            .context
            .get_stream(&self.stream)
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                durable,
                consumer::pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;

        Ok(Box::new(JetStreamConsumer { consumer }))
    }
}

struct JetStreamConsumer {
    consumer: consumer::PullConsumer,
}

#[async_trait]
impl BrokerConsumer for JetStreamConsumer {
    async fn fetch(
        &mut self,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(batch)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| BrokerError::Fetch(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| BrokerError::Fetch(e.to_string()))?;

            // `delivered` is 1-based; the pipeline counts redeliveries
            // from 0.
            let redeliveries = message
                .info()
                .map(|info| info.delivered.saturating_sub(1) as u32)
                .unwrap_or(0);

            out.push(BrokerMessage::new(
                message.subject.to_string(),
                message.payload.to_vec(),
                redeliveries,
                Box::new(JetStreamAck { message }),
            ));
        }
        Ok(out)
    }
}

struct JetStreamAck {
    message: jetstream::Message,
}

#[async_trait]
impl MessageAck for JetStreamAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nak(self: Box<Self>) -> Result<(), BrokerError> {
        self.message
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
