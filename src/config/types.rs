use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::event::Channel;

/// Root configuration for notifyd.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Message broker carrying events between stages
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Relational store (users, preferences, templates, deliveries)
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Ephemeral store (dedup, rate limits, in-app broadcast)
    #[serde(default)]
    pub cache: CacheConfig,

    /// Admin/metrics HTTP endpoint
    #[serde(default)]
    pub admin: AdminConfig,

    /// Logging settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Stage tuning (batch sizes, TTLs, rate limit)
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Delivery worker tuning (retries, backoff, circuit breaker)
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Broker backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process broker (volatile, single process only)
    #[default]
    Memory,
    /// NATS JetStream
    Nats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,

    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub url: String,

    /// Stream name; subjects live under `<stream>.>`
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Stream retention
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            url: default_nats_url(),
            stream: default_stream(),
            max_age_hours: default_max_age_hours(),
        }
    }
}

/// Relational backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,

    /// Postgres connection URL
    #[serde(default)]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            url: String::new(),
            max_connections: default_pool_size(),
        }
    }
}

/// Ephemeral backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            url: default_redis_url(),
        }
    }
}

/// Admin/metrics HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Serve /metrics, /healthz, /livez, /readyz, /stats
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_admin_address(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level (overridden by LOG_LEVEL / RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON logs instead of pretty output
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Stage tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ingestion batch size
    #[serde(default = "default_ingestion_batch")]
    pub ingestion_batch: usize,

    /// Renderer batch size (per channel)
    #[serde(default = "default_renderer_batch")]
    pub renderer_batch: usize,

    /// Preference filter batch size
    #[serde(default = "default_preferences_batch")]
    pub preferences_batch: usize,

    /// Broker fetch wait
    #[serde(default = "default_fetch_expires_ms")]
    pub fetch_expires_ms: u64,

    /// Dedup window
    #[serde(default = "default_hour_secs")]
    pub dedup_ttl_secs: u64,

    /// Sliding rate-limit window
    #[serde(default = "default_hour_secs")]
    pub rate_limit_ttl_secs: u64,

    /// Allowed sends per (user, channel, event type) per window
    #[serde(default = "default_rate_limit")]
    pub rate_limit: i64,

    /// Disable the synthesized fallback when no template exists
    #[serde(default)]
    pub disable_template_fallback: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingestion_batch: default_ingestion_batch(),
            renderer_batch: default_renderer_batch(),
            preferences_batch: default_preferences_batch(),
            fetch_expires_ms: default_fetch_expires_ms(),
            dedup_ttl_secs: default_hour_secs(),
            rate_limit_ttl_secs: default_hour_secs(),
            rate_limit: default_rate_limit(),
            disable_template_fallback: false,
        }
    }
}

impl PipelineConfig {
    pub fn fetch_expires(&self) -> Duration {
        Duration::from_millis(self.fetch_expires_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn rate_limit_ttl(&self) -> Duration {
        Duration::from_secs(self.rate_limit_ttl_secs)
    }
}

/// Per-channel delivery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDeliveryConfig {
    /// Backoff before redelivery attempt N (indexed by redelivery count - 1;
    /// the last entry repeats)
    pub retry_delays_ms: Vec<u64>,

    /// Circuit breaker cooldown once open
    pub cooldown_secs: u64,

    /// Worker batch size
    pub batch: usize,
}

/// Delivery worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Delivery attempts per message before the DLQ (broker max_deliver)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_email_delivery")]
    pub email: ChannelDeliveryConfig,

    #[serde(default = "default_sms_delivery")]
    pub sms: ChannelDeliveryConfig,

    #[serde(default = "default_push_delivery")]
    pub push: ChannelDeliveryConfig,

    #[serde(default = "default_in_app_delivery")]
    pub in_app: ChannelDeliveryConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            breaker_threshold: default_breaker_threshold(),
            email: default_email_delivery(),
            sms: default_sms_delivery(),
            push: default_push_delivery(),
            in_app: default_in_app_delivery(),
        }
    }
}

impl DeliveryConfig {
    pub fn channel(&self, channel: Channel) -> &ChannelDeliveryConfig {
        match channel {
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
            Channel::Push => &self.push,
            Channel::InApp => &self.in_app,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_stream() -> String {
    "notifications".to_string()
}

fn default_max_age_hours() -> u64 {
    24
}

fn default_pool_size() -> u32 {
    10
}

fn default_admin_address() -> SocketAddr {
    ([127, 0, 0, 1], 9464).into()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ingestion_batch() -> usize {
    10
}

fn default_renderer_batch() -> usize {
    5
}

fn default_preferences_batch() -> usize {
    10
}

fn default_fetch_expires_ms() -> u64 {
    5000
}

fn default_hour_secs() -> u64 {
    3600
}

fn default_rate_limit() -> i64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_email_delivery() -> ChannelDeliveryConfig {
    ChannelDeliveryConfig {
        retry_delays_ms: vec![1000, 5000, 15000],
        cooldown_secs: 10,
        batch: 5,
    }
}

fn default_sms_delivery() -> ChannelDeliveryConfig {
    ChannelDeliveryConfig {
        retry_delays_ms: vec![2000, 10000, 30000],
        cooldown_secs: 15,
        batch: 5,
    }
}

fn default_push_delivery() -> ChannelDeliveryConfig {
    ChannelDeliveryConfig {
        retry_delays_ms: vec![1000, 5000, 15000],
        cooldown_secs: 10,
        batch: 5,
    }
}

fn default_in_app_delivery() -> ChannelDeliveryConfig {
    ChannelDeliveryConfig {
        // In-app delivery is a local store write; retries are immediate
        // and uncommon.
        retry_delays_ms: vec![],
        cooldown_secs: 10,
        batch: 10,
    }
}
