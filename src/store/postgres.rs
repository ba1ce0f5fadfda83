//! Postgres store backend (sqlx).

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    ChannelTally, Delivery, DeliveryStatus, EventTypeTally, Preference, Store, StoreError,
    Template, User,
};
use crate::config::DatabaseConfig;
use crate::event::{Channel, EventType};

/// Schema bootstrap. Idempotent; applied at connect.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    email       TEXT NOT NULL UNIQUE,
    phone       TEXT,
    push_tokens TEXT[] NOT NULL DEFAULT '{}',
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS notification_preferences (
    user_id           TEXT NOT NULL,
    channel           TEXT NOT NULL,
    event_type        TEXT NOT NULL,
    enabled           BOOLEAN NOT NULL DEFAULT TRUE,
    quiet_hours_start TIME,
    quiet_hours_end   TIME,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (user_id, channel, event_type)
);

CREATE TABLE IF NOT EXISTS notification_templates (
    channel    TEXT NOT NULL,
    event_type TEXT NOT NULL,
    subject    TEXT,
    body       TEXT NOT NULL,
    variables  TEXT[] NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (channel, event_type)
);

CREATE TABLE IF NOT EXISTS notification_deliveries (
    id            UUID PRIMARY KEY,
    user_id       TEXT NOT NULL,
    channel       TEXT NOT NULL,
    event_type    TEXT NOT NULL,
    event_id      TEXT NOT NULL,
    status        TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    metadata      JSONB NOT NULL DEFAULT '{}',
    error         TEXT,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    delivered_at  TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_deliveries_user_id
    ON notification_deliveries (user_id);
CREATE INDEX IF NOT EXISTS idx_deliveries_status
    ON notification_deliveries (status);
CREATE INDEX IF NOT EXISTS idx_deliveries_created_at
    ON notification_deliveries (created_at);
CREATE INDEX IF NOT EXISTS idx_deliveries_event
    ON notification_deliveries (event_id, user_id, channel);
"#;

/// Postgres-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect, then apply the schema bootstrap.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Liveness probe for readiness checks.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    phone: Option<String>,
    push_tokens: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            phone: row.phone,
            push_tokens: row.push_tokens,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PreferenceRow {
    user_id: String,
    channel: String,
    event_type: String,
    enabled: bool,
    quiet_hours_start: Option<NaiveTime>,
    quiet_hours_end: Option<NaiveTime>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PreferenceRow> for Preference {
    type Error = StoreError;

    fn try_from(row: PreferenceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: row.user_id,
            channel: parse_channel(&row.channel)?,
            event_type: parse_event_type(&row.event_type)?,
            enabled: row.enabled,
            quiet_hours_start: row.quiet_hours_start,
            quiet_hours_end: row.quiet_hours_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    channel: String,
    event_type: String,
    subject: Option<String>,
    body: String,
    variables: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TemplateRow> for Template {
    type Error = StoreError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        Ok(Self {
            channel: parse_channel(&row.channel)?,
            event_type: parse_event_type(&row.event_type)?,
            subject: row.subject,
            body: row.body,
            variables: row.variables,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    user_id: String,
    channel: String,
    event_type: String,
    event_id: String,
    status: String,
    attempt_count: i32,
    metadata: serde_json::Value,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            channel: parse_channel(&row.channel)?,
            event_type: parse_event_type(&row.event_type)?,
            event_id: row.event_id,
            status: row.status.parse::<DeliveryStatus>()?,
            attempt_count: row.attempt_count,
            metadata: row.metadata,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            delivered_at: row.delivered_at,
        })
    }
}

fn parse_channel(s: &str) -> Result<Channel, StoreError> {
    s.parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown channel: {s}")))
}

fn parse_event_type(s: &str) -> Result<EventType, StoreError> {
    s.parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown event type: {s}")))
}

fn deliveries(rows: Vec<DeliveryRow>) -> Result<Vec<Delivery>, StoreError> {
    rows.into_iter().map(Delivery::try_from).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, phone, push_tokens, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                email = EXCLUDED.email,
                phone = EXCLUDED.phone,
                push_tokens = EXCLUDED.push_tokens,
                updated_at = now()
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(&user.push_tokens)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_preference(
        &self,
        user_id: &str,
        channel: Channel,
        event_type: EventType,
    ) -> Result<Option<Preference>, StoreError> {
        let row = sqlx::query_as::<_, PreferenceRow>(
            r#"
            SELECT * FROM notification_preferences
            WHERE user_id = $1 AND channel = $2 AND event_type = $3
            "#,
        )
        .bind(user_id)
        .bind(channel.as_str())
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Preference::try_from).transpose()
    }

    async fn upsert_preference(&self, preference: &Preference) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_preferences
                (user_id, channel, event_type, enabled,
                 quiet_hours_start, quiet_hours_end, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, channel, event_type) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                quiet_hours_start = EXCLUDED.quiet_hours_start,
                quiet_hours_end = EXCLUDED.quiet_hours_end,
                updated_at = now()
            "#,
        )
        .bind(&preference.user_id)
        .bind(preference.channel.as_str())
        .bind(preference.event_type.as_str())
        .bind(preference.enabled)
        .bind(preference.quiet_hours_start)
        .bind(preference.quiet_hours_end)
        .bind(preference.created_at)
        .bind(preference.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_template(
        &self,
        channel: Channel,
        event_type: EventType,
    ) -> Result<Option<Template>, StoreError> {
        let row = sqlx::query_as::<_, TemplateRow>(
            "SELECT * FROM notification_templates WHERE channel = $1 AND event_type = $2",
        )
        .bind(channel.as_str())
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Template::try_from).transpose()
    }

    async fn upsert_template(&self, template: &Template) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_templates
                (channel, event_type, subject, body, variables, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (channel, event_type) DO UPDATE SET
                subject = EXCLUDED.subject,
                body = EXCLUDED.body,
                variables = EXCLUDED.variables,
                updated_at = now()
            "#,
        )
        .bind(template.channel.as_str())
        .bind(template.event_type.as_str())
        .bind(&template.subject)
        .bind(&template.body)
        .bind(&template.variables)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_deliveries
                (id, user_id, channel, event_type, event_id, status, attempt_count,
                 metadata, error, created_at, updated_at, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(delivery.id)
        .bind(&delivery.user_id)
        .bind(delivery.channel.as_str())
        .bind(delivery.event_type.as_str())
        .bind(&delivery.event_id)
        .bind(delivery.status.as_str())
        .bind(delivery.attempt_count)
        .bind(&delivery.metadata)
        .bind(&delivery.error)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .bind(delivery.delivered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn channel_tallies(&self, since: DateTime<Utc>) -> Result<Vec<ChannelTally>, StoreError> {
        let rows: Vec<(String, i64, i64, i64, f64)> = sqlx::query_as(
            r#"
            SELECT channel,
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'delivered') AS delivered,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COALESCE(AVG(attempt_count)::float8, 0) AS avg_attempts
            FROM notification_deliveries
            WHERE created_at >= $1
            GROUP BY channel
            ORDER BY channel
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(channel, total, delivered, failed, avg_attempts)| {
                Ok(ChannelTally {
                    channel: parse_channel(&channel)?,
                    total,
                    delivered,
                    failed,
                    avg_attempts,
                })
            })
            .collect()
    }

    async fn event_type_tallies(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventTypeTally>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT event_type, COUNT(*) AS count
            FROM notification_deliveries
            WHERE created_at >= $1
            GROUP BY event_type
            ORDER BY count DESC, event_type
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(event_type, count)| {
                Ok(EventTypeTally {
                    event_type: parse_event_type(&event_type)?,
                    count,
                })
            })
            .collect()
    }

    async fn deliveries_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Delivery>, StoreError> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT * FROM notification_deliveries
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        deliveries(rows)
    }

    async fn failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, StoreError> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT * FROM notification_deliveries
            WHERE status = 'failed'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        deliveries(rows)
    }

    async fn deliveries_for_event(&self, event_id: &str) -> Result<Vec<Delivery>, StoreError> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT * FROM notification_deliveries
            WHERE event_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        deliveries(rows)
    }
}
