mod metrics;
mod tracing;

pub use self::metrics::{counters, AdminState, Metrics, MetricsConfig};
pub use self::tracing::init_tracing;
