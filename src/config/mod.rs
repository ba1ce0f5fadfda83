mod loader;
mod types;

pub use types::{
    AdminConfig, BrokerBackend, BrokerConfig, CacheBackend, CacheConfig, ChannelDeliveryConfig,
    Config, DatabaseBackend, DatabaseConfig, DeliveryConfig, PipelineConfig, TelemetryConfig,
};
