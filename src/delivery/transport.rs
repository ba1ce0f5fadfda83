//! Transport adapters.
//!
//! A transport performs the channel-specific I/O for one rendered
//! notification: either it succeeds or it fails with an error message,
//! no partial states. The built-in adapters validate their contact-field
//! precondition and log the send; real provider integrations plug in
//! behind the same trait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::event::{Channel, RenderedNotification};

/// Transport failure. Retried until the broker's delivery budget is
/// exhausted, then dead-lettered.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("missing contact field: {0}")]
    MissingContact(&'static str),

    #[error("send failed: {0}")]
    Send(String),
}

/// Successful send, with channel-specific delivery metadata for the
/// audit row.
#[derive(Debug, Clone)]
pub struct TransportReceipt {
    pub metadata: serde_json::Value,
}

/// Channel delivery seam.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        notification: &RenderedNotification,
    ) -> Result<TransportReceipt, TransportError>;
}

/// Logging email adapter.
pub struct EmailTransport;

#[async_trait]
impl Transport for EmailTransport {
    fn name(&self) -> &'static str {
        "email-log"
    }

    async fn send(
        &self,
        notification: &RenderedNotification,
    ) -> Result<TransportReceipt, TransportError> {
        let recipient = notification
            .user_email
            .as_deref()
            .ok_or(TransportError::MissingContact("user_email"))?;

        info!(
            event_id = %notification.event_id,
            recipient = %recipient,
            subject = notification.subject.as_deref().unwrap_or(""),
            "email sent"
        );

        Ok(TransportReceipt {
            metadata: json!({
                "transport": self.name(),
                "recipient": recipient,
                "subject": notification.subject,
            }),
        })
    }
}

/// Logging SMS adapter.
pub struct SmsTransport;

#[async_trait]
impl Transport for SmsTransport {
    fn name(&self) -> &'static str {
        "sms-log"
    }

    async fn send(
        &self,
        notification: &RenderedNotification,
    ) -> Result<TransportReceipt, TransportError> {
        let recipient = notification
            .user_phone
            .as_deref()
            .ok_or(TransportError::MissingContact("user_phone"))?;

        info!(
            event_id = %notification.event_id,
            recipient = %recipient,
            "sms sent"
        );

        Ok(TransportReceipt {
            metadata: json!({
                "transport": self.name(),
                "recipient": recipient,
            }),
        })
    }
}

/// Logging push adapter.
pub struct PushTransport;

#[async_trait]
impl Transport for PushTransport {
    fn name(&self) -> &'static str {
        "push-log"
    }

    async fn send(
        &self,
        notification: &RenderedNotification,
    ) -> Result<TransportReceipt, TransportError> {
        if notification.user_push_tokens.is_empty() {
            return Err(TransportError::MissingContact("user_push_tokens"));
        }
        let device_count = notification.user_push_tokens.len();

        info!(
            event_id = %notification.event_id,
            device_count,
            "push sent"
        );

        Ok(TransportReceipt {
            metadata: json!({
                "transport": self.name(),
                "device_count": device_count,
            }),
        })
    }
}

/// In-app adapter. The delivery row itself is the notification; the
/// worker broadcasts it to the fan-out layer afterwards.
pub struct InAppTransport;

#[async_trait]
impl Transport for InAppTransport {
    fn name(&self) -> &'static str {
        "in_app"
    }

    async fn send(
        &self,
        notification: &RenderedNotification,
    ) -> Result<TransportReceipt, TransportError> {
        info!(
            event_id = %notification.event_id,
            user_id = %notification.user_id,
            "in-app notification stored"
        );

        Ok(TransportReceipt {
            metadata: json!({ "transport": self.name() }),
        })
    }
}

/// The built-in adapter for a channel.
pub fn default_transport(channel: Channel) -> Arc<dyn Transport> {
    match channel {
        Channel::Email => Arc::new(EmailTransport),
        Channel::Sms => Arc::new(SmsTransport),
        Channel::Push => Arc::new(PushTransport),
        Channel::InApp => Arc::new(InAppTransport),
    }
}

/// Scripted transport for tests: fails the first `fail_times` sends,
/// optionally adding latency.
pub struct MockTransport {
    fail_times: AtomicU32,
    latency: Duration,
    sends: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            fail_times: AtomicU32::new(0),
            latency: Duration::ZERO,
            sends: AtomicU32::new(0),
        }
    }

    pub fn failing(times: u32) -> Self {
        Self {
            fail_times: AtomicU32::new(times),
            latency: Duration::ZERO,
            sends: AtomicU32::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Total send attempts observed.
    pub fn sends(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send(
        &self,
        _notification: &RenderedNotification,
    ) -> Result<TransportReceipt, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let remaining = self
            .fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(TransportError::Send("scripted failure".to_string()));
        }

        Ok(TransportReceipt {
            metadata: json!({ "transport": self.name() }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EnrichedEvent, EventData, EventType, Priority, RoutedEvent, SubmittedEvent};
    use crate::event::ContactSnapshot;
    use chrono::Utc;

    fn notification(
        channel: Channel,
        contact: Option<ContactSnapshot>,
    ) -> RenderedNotification {
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
        let enriched = EnrichedEvent::from_submitted(submitted, contact);
        let routed = RoutedEvent::for_channel(&enriched, channel);
        RenderedNotification::from_routed(&routed, Some("s".into()), "b".into())
    }

    fn full_contact() -> ContactSnapshot {
        ContactSnapshot {
            email: "alice@ex.com".into(),
            phone: Some("+15550100".into()),
            push_tokens: vec!["tok1".into(), "tok2".into()],
        }
    }

    #[tokio::test]
    async fn test_email_requires_address() {
        let transport = EmailTransport;
        let err = transport
            .send(&notification(Channel::Email, None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::MissingContact("user_email")));

        let receipt = transport
            .send(&notification(Channel::Email, Some(full_contact())))
            .await
            .unwrap();
        assert_eq!(receipt.metadata["recipient"], "alice@ex.com");
        assert_eq!(receipt.metadata["subject"], "s");
    }

    #[tokio::test]
    async fn test_sms_requires_phone() {
        let transport = SmsTransport;
        let mut contact = full_contact();
        contact.phone = None;
        let err = transport
            .send(&notification(Channel::Sms, Some(contact)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::MissingContact("user_phone")));
    }

    #[tokio::test]
    async fn test_push_requires_tokens_and_counts_devices() {
        let transport = PushTransport;
        let mut contact = full_contact();
        contact.push_tokens.clear();
        assert!(transport
            .send(&notification(Channel::Push, Some(contact)))
            .await
            .is_err());

        let receipt = transport
            .send(&notification(Channel::Push, Some(full_contact())))
            .await
            .unwrap();
        assert_eq!(receipt.metadata["device_count"], 2);
    }

    #[tokio::test]
    async fn test_in_app_always_succeeds() {
        let transport = InAppTransport;
        assert!(transport
            .send(&notification(Channel::InApp, None))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_mock_fails_then_succeeds() {
        let transport = MockTransport::failing(2);
        let n = notification(Channel::Email, None);

        assert!(transport.send(&n).await.is_err());
        assert!(transport.send(&n).await.is_err());
        assert!(transport.send(&n).await.is_ok());
        assert_eq!(transport.sends(), 3);
    }
}
