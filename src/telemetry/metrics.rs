use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Metrics/admin server configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// HTTP endpoint address
    pub address: SocketAddr,
}

/// Admin state for health/readiness endpoints.
#[derive(Debug)]
pub struct AdminState {
    start_time: Instant,
    healthy: AtomicBool,
    ready: AtomicBool,
    registry: Registry,
}

impl AdminState {
    fn new(registry: Registry) -> Self {
        Self {
            start_time: Instant::now(),
            healthy: AtomicBool::new(true),
            // Readiness flips on once the backends are connected and the
            // stages are running.
            ready: AtomicBool::new(false),
            registry,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Sum a counter family across label sets, optionally matching one
    /// label value. Backs the /stats endpoint without double bookkeeping.
    fn counter_sum(&self, family: &str, label: Option<(&str, &str)>) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|mf| mf.get_name() == family)
            .flat_map(|mf| mf.get_metric())
            .filter(|m| match label {
                None => true,
                Some((name, value)) => m
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == name && l.get_value() == value),
            })
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }
}

/// Prometheus metrics with the admin HTTP surface.
pub struct Metrics {
    registry: Registry,
    address: SocketAddr,
    admin_state: Arc<AdminState>,
}

impl Metrics {
    pub fn new(config: &MetricsConfig) -> Result<Arc<Self>> {
        let registry = Registry::new();
        counters::init(&registry);

        Ok(Arc::new(Self {
            admin_state: Arc::new(AdminState::new(registry.clone())),
            registry,
            address: config.address,
        }))
    }

    /// Admin state handle for readiness updates from the bootstrap.
    pub fn admin_state(&self) -> Arc<AdminState> {
        self.admin_state.clone()
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Serve /metrics and the admin endpoints until the process exits.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let metrics = self.clone();
        let admin_state = self.admin_state.clone();

        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let m = metrics.clone();
                    async move { m.render() }
                }),
            )
            .route("/healthz", get(healthz_handler))
            .route("/livez", get(livez_handler))
            .route("/readyz", get(readyz_handler))
            .route("/stats", get(stats_handler))
            .with_state(admin_state);

        let listener = tokio::net::TcpListener::bind(self.address).await?;

        info!(address = %self.address, "metrics server started");

        axum::serve(listener, app).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    uptime_seconds: u64,
    events_processed: u64,
    events_failed: u64,
    deliveries_delivered: u64,
    deliveries_failed: u64,
}

async fn healthz_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let healthy = state.is_healthy();
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    if healthy {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let ready = state.is_ready();
    let response = ReadinessResponse { ready };

    if ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn stats_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let response = StatsResponse {
        uptime_seconds: state.uptime_secs(),
        events_processed: state.counter_sum("events_processed_total", None),
        events_failed: state.counter_sum("events_failed_total", None),
        deliveries_delivered: state.counter_sum("deliveries_total", Some(("status", "delivered"))),
        deliveries_failed: state.counter_sum("deliveries_total", Some(("status", "failed"))),
    };
    Json(response)
}

/// Pipeline metrics. Statics initialize on first registry registration;
/// recording before init is a no-op, so unit tests never have to care.
pub mod counters {
    use prometheus::{
        HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    };
    use std::sync::OnceLock;

    use crate::event::{Channel, EventType};
    use crate::store::DeliveryStatus;

    static EVENTS_RECEIVED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
    static EVENTS_PROCESSED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
    static EVENTS_FAILED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
    static DUPLICATES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
    static DELIVERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
    static DELIVERY_DURATION: OnceLock<HistogramVec> = OnceLock::new();
    static ACTIVE_WEBSOCKET_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();

    /// Delivery latency buckets, in seconds.
    const DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

    /// Create the metric families and register them with `registry`.
    ///
    /// Safe to call more than once (tests spin up separate registries);
    /// the families are created once and re-registered.
    pub fn init(registry: &Registry) {
        let events_received = EVENTS_RECEIVED_TOTAL.get_or_init(|| {
            IntCounterVec::new(
                Opts::new("events_received_total", "Events pulled from the broker"),
                &["event_type"],
            )
            .expect("valid metric definition")
        });
        let _ = registry.register(Box::new(events_received.clone()));

        let events_processed = EVENTS_PROCESSED_TOTAL.get_or_init(|| {
            IntCounterVec::new(
                Opts::new(
                    "events_processed_total",
                    "Events enriched and published downstream",
                ),
                &["event_type"],
            )
            .expect("valid metric definition")
        });
        let _ = registry.register(Box::new(events_processed.clone()));

        let events_failed = EVENTS_FAILED_TOTAL.get_or_init(|| {
            IntCounterVec::new(
                Opts::new("events_failed_total", "Events dropped or failed by reason"),
                &["event_type", "reason"],
            )
            .expect("valid metric definition")
        });
        let _ = registry.register(Box::new(events_failed.clone()));

        let duplicates = DUPLICATES_TOTAL.get_or_init(|| {
            IntCounterVec::new(
                Opts::new("duplicates_total", "Events discarded by the dedup window"),
                &["event_type"],
            )
            .expect("valid metric definition")
        });
        let _ = registry.register(Box::new(duplicates.clone()));

        let deliveries = DELIVERIES_TOTAL.get_or_init(|| {
            IntCounterVec::new(
                Opts::new("deliveries_total", "Delivery outcomes by channel and status"),
                &["channel", "status"],
            )
            .expect("valid metric definition")
        });
        let _ = registry.register(Box::new(deliveries.clone()));

        let duration = DELIVERY_DURATION.get_or_init(|| {
            HistogramVec::new(
                HistogramOpts::new(
                    "delivery_duration_seconds",
                    "Transport call latency by channel",
                )
                .buckets(DURATION_BUCKETS.to_vec()),
                &["channel"],
            )
            .expect("valid metric definition")
        });
        let _ = registry.register(Box::new(duration.clone()));

        let ws = ACTIVE_WEBSOCKET_CONNECTIONS.get_or_init(|| {
            IntGauge::new(
                "active_websocket_connections",
                "Connected real-time clients (maintained by the fan-out layer)",
            )
            .expect("valid metric definition")
        });
        let _ = registry.register(Box::new(ws.clone()));
    }

    pub fn event_received(event_type: EventType) {
        if let Some(c) = EVENTS_RECEIVED_TOTAL.get() {
            c.with_label_values(&[event_type.as_str()]).inc();
        }
    }

    pub fn event_processed(event_type: EventType) {
        if let Some(c) = EVENTS_PROCESSED_TOTAL.get() {
            c.with_label_values(&[event_type.as_str()]).inc();
        }
    }

    /// `event_type` is "unknown" when the payload never decoded.
    pub fn event_failed(event_type: &str, reason: &str) {
        if let Some(c) = EVENTS_FAILED_TOTAL.get() {
            c.with_label_values(&[event_type, reason]).inc();
        }
    }

    pub fn duplicate(event_type: EventType) {
        if let Some(c) = DUPLICATES_TOTAL.get() {
            c.with_label_values(&[event_type.as_str()]).inc();
        }
    }

    pub fn delivery(channel: Channel, status: DeliveryStatus) {
        if let Some(c) = DELIVERIES_TOTAL.get() {
            c.with_label_values(&[channel.as_str(), status.as_str()]).inc();
        }
    }

    pub fn delivery_duration(channel: Channel, duration_secs: f64) {
        if let Some(h) = DELIVERY_DURATION.get() {
            h.with_label_values(&[channel.as_str()]).observe(duration_secs);
        }
    }

    /// Owned by the external fan-out layer; exposed here so the whole
    /// platform scrapes one endpoint.
    pub fn set_active_websocket_connections(count: i64) {
        if let Some(g) = ACTIVE_WEBSOCKET_CONNECTIONS.get() {
            g.set(count);
        }
    }
}
