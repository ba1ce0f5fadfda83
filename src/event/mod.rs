//! Wire data model for the notification pipeline.
//!
//! Every stage consumes one of these JSON-encoded types from the broker
//! and publishes the next one. `event_id` is assigned at submission and
//! propagated end-to-end.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

impl Channel {
    /// All channels, in routing order.
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Sms, Channel::Push, Channel::InApp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
            Self::InApp => "in_app",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "push" => Ok(Self::Push),
            "in_app" => Ok(Self::InApp),
            other => Err(ValidationError::UnknownChannel(other.to_string())),
        }
    }
}

/// Event category. Drives preference lookup and template selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Account,
    Security,
    Marketing,
    System,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Security => "security",
            Self::Marketing => "marketing",
            Self::System => "system",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(Self::Account),
            "security" => Ok(Self::Security),
            "marketing" => Ok(Self::Marketing),
            "system" => Ok(Self::System),
            other => Err(ValidationError::UnknownEventType(other.to_string())),
        }
    }
}

/// Message priority. Carried end-to-end; delivery order within a subject
/// is broker FIFO regardless of priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

/// Template payload data. BTreeMap keeps serialization deterministic.
pub type EventData = BTreeMap<String, Value>;

/// An event as submitted by the external HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub user_id: String,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub data: EventData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventData>,
    pub created_at: DateTime<Utc>,
}

impl SubmittedEvent {
    /// Schema validation beyond what decoding enforces.
    ///
    /// Decoding already rejects unknown enum values and non-RFC-3339
    /// timestamps; this checks the constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.event_id.is_empty() {
            return Err(ValidationError::MissingField("event_id"));
        }
        if self.user_id.is_empty() {
            return Err(ValidationError::MissingField("user_id"));
        }
        if self.channels.is_empty() {
            return Err(ValidationError::NoChannels);
        }
        Ok(())
    }

    /// Whether the event's validity window has already closed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }
}

/// A submitted event with recipient contact data resolved.
///
/// Contact fields stay empty when the user is unknown; channels that
/// require them fail at the transport and surface via the DLQ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub user_id: String,
    pub channels: Vec<Channel>,
    pub priority: Priority,
    #[serde(default)]
    pub data: EventData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventData>,
    pub created_at: DateTime<Utc>,
    pub enriched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_phone: Option<String>,
    #[serde(default)]
    pub user_push_tokens: Vec<String>,
}

impl EnrichedEvent {
    /// Attach a contact snapshot to a submitted event. `contact` is `None`
    /// when the user lookup found nothing.
    pub fn from_submitted(event: SubmittedEvent, contact: Option<ContactSnapshot>) -> Self {
        let (user_email, user_phone, user_push_tokens) = match contact {
            Some(c) => (Some(c.email), c.phone, c.push_tokens),
            None => (None, None, Vec::new()),
        };
        Self {
            event_id: event.event_id,
            event_type: event.event_type,
            user_id: event.user_id,
            channels: event.channels,
            priority: event.priority,
            data: event.data,
            scheduled_at: event.scheduled_at,
            expires_at: event.expires_at,
            metadata: event.metadata,
            created_at: event.created_at,
            enriched_at: Utc::now().trunc_subsecs(3),
            user_email,
            user_phone,
            user_push_tokens,
        }
    }
}

/// Contact fields copied from the user record at enrichment time.
#[derive(Debug, Clone)]
pub struct ContactSnapshot {
    pub email: String,
    pub phone: Option<String>,
    pub push_tokens: Vec<String>,
}

/// An enriched event routed to a single allowed channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub user_id: String,
    pub channel: Channel,
    pub priority: Priority,
    #[serde(default)]
    pub data: EventData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventData>,
    pub created_at: DateTime<Utc>,
    pub enriched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_phone: Option<String>,
    #[serde(default)]
    pub user_push_tokens: Vec<String>,
}

impl RoutedEvent {
    pub fn for_channel(event: &EnrichedEvent, channel: Channel) -> Self {
        Self {
            event_id: event.event_id.clone(),
            event_type: event.event_type,
            user_id: event.user_id.clone(),
            channel,
            priority: event.priority,
            data: event.data.clone(),
            metadata: event.metadata.clone(),
            created_at: event.created_at,
            enriched_at: event.enriched_at,
            user_email: event.user_email.clone(),
            user_phone: event.user_phone.clone(),
            user_push_tokens: event.user_push_tokens.clone(),
        }
    }
}

/// A routed event with its channel body rendered, ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedNotification {
    pub event_id: String,
    pub event_type: EventType,
    pub user_id: String,
    pub channel: Channel,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventData>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    pub rendered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_phone: Option<String>,
    #[serde(default)]
    pub user_push_tokens: Vec<String>,
}

impl RenderedNotification {
    pub fn from_routed(event: &RoutedEvent, subject: Option<String>, body: String) -> Self {
        Self {
            event_id: event.event_id.clone(),
            event_type: event.event_type,
            user_id: event.user_id.clone(),
            channel: event.channel,
            priority: event.priority,
            metadata: event.metadata.clone(),
            created_at: event.created_at,
            subject,
            body,
            rendered_at: Utc::now().trunc_subsecs(3),
            user_email: event.user_email.clone(),
            user_phone: event.user_phone.clone(),
            user_push_tokens: event.user_push_tokens.clone(),
        }
    }
}

/// A rendered notification that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    #[serde(flatten)]
    pub notification: RenderedNotification,
    pub error: String,
    pub moved_to_dlq_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(notification: RenderedNotification, error: impl Into<String>) -> Self {
        Self {
            notification,
            error: error.into(),
            moved_to_dlq_at: Utc::now().trunc_subsecs(3),
        }
    }
}

/// Errors from submitted-event schema validation. These are terminal:
/// the poison message is dropped, never redelivered.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("channels must not be empty")]
    NoChannels,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}
