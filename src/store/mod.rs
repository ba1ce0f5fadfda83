//! Relational store: users, preferences, templates and the delivery
//! audit log.
//!
//! The core reads users/preferences/templates (the external HTTP layer
//! owns their lifecycle) and writes delivery rows. Analytics runs
//! aggregate queries over deliveries.
//!
//! # Implementations
//!
//! - [`MemoryStore`]: development and tests (default)
//! - [`PgStore`]: Postgres via sqlx

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::event::{Channel, EventType};

/// Recipient identity. Managed externally; the core only reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub push_tokens: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            email: email.into(),
            phone: None,
            push_tokens: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_push_tokens(mut self, tokens: Vec<String>) -> Self {
        self.push_tokens = tokens;
        self
    }
}

/// Delivery decision rule for one (user, channel, event type).
///
/// Quiet-hours fields are either both set or both absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub user_id: String,
    pub channel: Channel,
    pub event_type: EventType,
    pub enabled: bool,
    #[serde(default)]
    pub quiet_hours_start: Option<NaiveTime>,
    #[serde(default)]
    pub quiet_hours_end: Option<NaiveTime>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Preference {
    pub fn new(user_id: impl Into<String>, channel: Channel, event_type: EventType) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            channel,
            event_type,
            enabled: true,
            quiet_hours_start: None,
            quiet_hours_end: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_quiet_hours(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.quiet_hours_start = Some(start);
        self.quiet_hours_end = Some(end);
        self
    }
}

/// Rendering rule for one (channel, event type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub channel: Channel,
    pub event_type: EventType,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    /// Placeholder names eligible for substitution.
    #[serde(default)]
    pub variables: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn new(channel: Channel, event_type: EventType, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            channel,
            event_type,
            subject: None,
            body: body.into(),
            variables: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_variables(mut self, variables: Vec<String>) -> Self {
        self.variables = variables;
        self
    }
}

/// Delivery attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Bounced,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Bounced => "bounced",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Bounced)
    }
}

impl FromStr for DeliveryStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "bounced" => Ok(Self::Bounced),
            other => Err(StoreError::Corrupt(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// Audit row written by delivery workers after an attempt concludes.
/// Terminal rows are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub user_id: String,
    pub channel: Channel,
    pub event_type: EventType,
    pub event_id: String,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    /// Channel-specific details (recipient, transport name, device count).
    pub metadata: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Successful terminal row.
    pub fn delivered(
        user_id: impl Into<String>,
        channel: Channel,
        event_type: EventType,
        event_id: impl Into<String>,
        attempt_count: i32,
        metadata: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            channel,
            event_type,
            event_id: event_id.into(),
            status: DeliveryStatus::Delivered,
            attempt_count,
            metadata,
            error: None,
            created_at: now,
            updated_at: now,
            delivered_at: Some(now),
        }
    }

    /// Terminal failure row, written alongside the DLQ publish.
    pub fn failed(
        user_id: impl Into<String>,
        channel: Channel,
        event_type: EventType,
        event_id: impl Into<String>,
        attempt_count: i32,
        metadata: Value,
        error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            channel,
            event_type,
            event_id: event_id.into(),
            status: DeliveryStatus::Failed,
            attempt_count,
            metadata,
            error: Some(error.into()),
            created_at: now,
            updated_at: now,
            delivered_at: None,
        }
    }
}

/// Per-channel aggregate over a time window.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelTally {
    pub channel: Channel,
    pub total: i64,
    pub delivered: i64,
    pub failed: i64,
    pub avg_attempts: f64,
}

/// Event-type frequency over a time window.
#[derive(Debug, Clone, Serialize)]
pub struct EventTypeTally {
    pub event_type: EventType,
    pub count: i64,
}

/// Errors from the relational store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Relational store seam.
///
/// The upserts exist for the external management layer and for seeding;
/// the pipeline itself only reads them.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;
    async fn upsert_user(&self, user: &User) -> Result<(), StoreError>;

    async fn get_preference(
        &self,
        user_id: &str,
        channel: Channel,
        event_type: EventType,
    ) -> Result<Option<Preference>, StoreError>;
    async fn upsert_preference(&self, preference: &Preference) -> Result<(), StoreError>;

    async fn get_template(
        &self,
        channel: Channel,
        event_type: EventType,
    ) -> Result<Option<Template>, StoreError>;
    async fn upsert_template(&self, template: &Template) -> Result<(), StoreError>;

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StoreError>;

    /// Per-channel totals for deliveries created at or after `since`.
    async fn channel_tallies(&self, since: DateTime<Utc>) -> Result<Vec<ChannelTally>, StoreError>;

    /// Most frequent event types at or after `since`, descending.
    async fn event_type_tallies(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventTypeTally>, StoreError>;

    /// A user's deliveries, newest first.
    async fn deliveries_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Delivery>, StoreError>;

    /// Terminal failures, newest first.
    async fn failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, StoreError>;

    /// All attempts for one event, oldest first.
    async fn deliveries_for_event(&self, event_id: &str) -> Result<Vec<Delivery>, StoreError>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn Store>;

/// Create a store backend based on configuration.
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<SharedStore> {
    match config.backend {
        DatabaseBackend::Memory => {
            tracing::info!("using in-memory store (volatile)");
            Ok(Arc::new(MemoryStore::new()))
        }
        DatabaseBackend::Postgres => {
            let store = PgStore::connect(config).await?;
            tracing::info!(pool_size = config.max_connections, "connected to postgres");
            Ok(Arc::new(store))
        }
    }
}
