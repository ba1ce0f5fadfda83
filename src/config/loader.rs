use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

use super::types::{BrokerBackend, CacheBackend, Config, DatabaseBackend};

impl Config {
    /// Load configuration from a YAML file, then apply environment
    /// overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config = Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides (no config file).
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;
        Ok(config)
    }

    /// Environment overrides. Setting a URL also selects the matching
    /// external backend, so a container needs nothing but env vars.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("NATS_URL") {
            if !url.is_empty() {
                self.broker.url = url;
                self.broker.backend = BrokerBackend::Nats;
            }
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                self.database.url = url;
                self.database.backend = DatabaseBackend::Postgres;
            }
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                self.cache.url = url;
                self.cache.backend = CacheBackend::Redis;
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            if !level.is_empty() {
                self.telemetry.log_level = level;
            }
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.broker.backend == BrokerBackend::Nats && self.broker.url.is_empty() {
            anyhow::bail!("broker.url must be set for the nats backend");
        }
        if self.database.backend == DatabaseBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("database.url must be set for the postgres backend");
        }
        if self.cache.backend == CacheBackend::Redis && self.cache.url.is_empty() {
            anyhow::bail!("cache.url must be set for the redis backend");
        }
        if self.broker.stream.is_empty() {
            anyhow::bail!("broker.stream must not be empty");
        }
        if self.pipeline.ingestion_batch == 0
            || self.pipeline.preferences_batch == 0
            || self.pipeline.renderer_batch == 0
        {
            anyhow::bail!("pipeline batch sizes must be positive");
        }
        if self.pipeline.rate_limit <= 0 {
            anyhow::bail!("pipeline.rate_limit must be positive");
        }
        if self.delivery.max_retries == 0 {
            anyhow::bail!("delivery.max_retries must be at least 1");
        }
        if self.delivery.breaker_threshold == 0 {
            anyhow::bail!("delivery.breaker_threshold must be at least 1");
        }
        for channel in crate::event::Channel::ALL {
            if self.delivery.channel(channel).batch == 0 {
                anyhow::bail!("delivery.{}.batch must be positive", channel);
            }
        }
        Ok(())
    }
}
