//! End-to-end pipeline tests over the in-memory backends.
//!
//! All stages run as real tasks wired through the broker; each test
//! drives the pipeline by publishing submitted events and asserting on
//! delivery rows, routed subjects and the DLQ.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use serde_json::json;

use notifyd::analytics::AnalyticsReader;
use notifyd::bootstrap::Shutdown;
use notifyd::broker::{subjects, Broker, MemoryBroker};
use notifyd::cache::{keys, Ephemeral, MemoryEphemeral};
use notifyd::config::{ChannelDeliveryConfig, DeliveryConfig, PipelineConfig};
use notifyd::delivery::{default_transport, DeliveryWorker, MockTransport, Transport};
use notifyd::event::{Channel, EventType};
use notifyd::pipeline::{IngestionStage, PreferenceStage, RenderStage};
use notifyd::store::{
    DeliveryStatus, MemoryStore, Preference, Store, Template, User,
};

struct Pipeline {
    broker: MemoryBroker,
    store: Arc<MemoryStore>,
    cache: Arc<MemoryEphemeral>,
    shutdown: Arc<Shutdown>,
    handles: Vec<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        fetch_expires_ms: 50,
        ..Default::default()
    }
}

/// Worker tuning without backoff sleeps, so retries land quickly.
fn delivery_config() -> DeliveryConfig {
    let instant = ChannelDeliveryConfig {
        retry_delays_ms: vec![],
        cooldown_secs: 0,
        batch: 5,
    };
    DeliveryConfig {
        max_retries: 3,
        breaker_threshold: 5,
        email: instant.clone(),
        sms: instant.clone(),
        push: instant.clone(),
        in_app: instant,
    }
}

impl Pipeline {
    /// Start every stage with the default (logging) transports.
    async fn start() -> Self {
        Self::start_with_email_transport(default_transport(Channel::Email)).await
    }

    /// Start every stage, overriding the email transport.
    async fn start_with_email_transport(email_transport: Arc<dyn Transport>) -> Self {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryEphemeral::new());
        let shutdown = Shutdown::new();
        let shared_broker: Arc<dyn Broker> = Arc::new(broker.clone());

        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            IngestionStage::new(
                shared_broker.clone(),
                store.clone(),
                cache.clone(),
                pipeline_config(),
                shutdown.clone(),
            )
            .run(),
        ));

        handles.push(tokio::spawn(
            PreferenceStage::new(
                shared_broker.clone(),
                store.clone(),
                cache.clone(),
                pipeline_config(),
                shutdown.clone(),
            )
            .run(),
        ));

        for channel in Channel::ALL {
            handles.push(tokio::spawn(
                RenderStage::new(
                    channel,
                    shared_broker.clone(),
                    store.clone(),
                    pipeline_config(),
                    shutdown.clone(),
                )
                .run(),
            ));
        }

        for channel in Channel::ALL {
            let transport = if channel == Channel::Email {
                email_transport.clone()
            } else {
                default_transport(channel)
            };
            handles.push(tokio::spawn(
                DeliveryWorker::new(
                    channel,
                    shared_broker.clone(),
                    store.clone(),
                    cache.clone(),
                    transport,
                    delivery_config(),
                    Duration::from_millis(50),
                    shutdown.clone(),
                )
                .run(),
            ));
        }

        Self {
            broker,
            store,
            cache,
            shutdown,
            handles,
        }
    }

    async fn submit(&self, payload: serde_json::Value) {
        self.broker
            .publish(subjects::EVENTS, payload.to_string().as_bytes())
            .await
            .unwrap();
    }

    /// Poll until `condition` holds or the timeout elapses.
    async fn wait_for<F>(&self, what: &str, mut condition: F)
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Give in-flight messages time to settle after the state under test
    /// was reached.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    async fn stop(self) {
        self.shutdown.trigger();
        for handle in self.handles {
            handle.await.unwrap().unwrap();
        }
    }
}

fn submitted_event(event_id: &str, event_type: &str, user_id: &str, channels: &[&str]) -> serde_json::Value {
    json!({
        "event_id": event_id,
        "event_type": event_type,
        "user_id": user_id,
        "channels": channels,
        "priority": "normal",
        "data": {"appName": "Acme", "userName": "Alice"},
        "created_at": "2026-01-01T00:00:00Z",
    })
}

#[tokio::test]
async fn scenario_happy_path_email() {
    let pipeline = Pipeline::start().await;
    pipeline
        .store
        .upsert_user(&User::new("u1", "alice@ex.com"))
        .await
        .unwrap();
    pipeline
        .store
        .upsert_template(
            &Template::new(Channel::Email, EventType::Account, "Hi {{userName}}")
                .with_subject("Welcome {{appName}}!")
                .with_variables(vec!["appName".into(), "userName".into()]),
        )
        .await
        .unwrap();

    pipeline
        .submit(submitted_event("e1", "account", "u1", &["email"]))
        .await;

    pipeline
        .wait_for("delivery row", |p| p.store.delivery_count() == 1)
        .await;

    let rows = pipeline.store.deliveries_for_event("e1").await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.channel, Channel::Email);
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert_eq!(row.attempt_count, 1);
    assert_eq!(row.metadata["subject"], "Welcome Acme!");
    assert_eq!(row.metadata["recipient"], "alice@ex.com");

    // Exactly one rendered message reached the delivery subject.
    assert_eq!(
        pipeline
            .broker
            .published_count(&subjects::delivery(Channel::Email)),
        1
    );

    pipeline.stop().await;
}

#[tokio::test]
async fn scenario_duplicate_submission_suppressed() {
    let pipeline = Pipeline::start().await;
    pipeline
        .store
        .upsert_user(&User::new("u1", "alice@ex.com"))
        .await
        .unwrap();

    pipeline
        .submit(submitted_event("e1", "account", "u1", &["email"]))
        .await;
    pipeline
        .wait_for("first delivery", |p| p.store.delivery_count() == 1)
        .await;

    // Identical resubmission within the dedup window.
    pipeline
        .submit(submitted_event("e1", "account", "u1", &["email"]))
        .await;
    pipeline.settle().await;

    assert_eq!(pipeline.broker.published_count(subjects::ENRICHED), 1);
    assert_eq!(pipeline.store.delivery_count(), 1);
    assert_eq!(
        pipeline.cache.get_counter(&keys::dedup("e1")).await.unwrap(),
        Some(1)
    );

    pipeline.stop().await;
}

#[tokio::test]
async fn scenario_marketing_denied_by_default() {
    let pipeline = Pipeline::start().await;
    pipeline
        .store
        .upsert_user(&User::new("u2", "bob@ex.com").with_phone("+15550123"))
        .await
        .unwrap();

    pipeline
        .submit(submitted_event("e2", "marketing", "u2", &["email", "sms"]))
        .await;

    pipeline
        .wait_for("ingestion", |p| {
            p.broker.published_count(subjects::ENRICHED) == 1
        })
        .await;
    pipeline.settle().await;

    assert_eq!(
        pipeline
            .broker
            .published_count(&subjects::routed(Channel::Email)),
        0
    );
    assert_eq!(
        pipeline
            .broker
            .published_count(&subjects::routed(Channel::Sms)),
        0
    );
    assert_eq!(pipeline.store.delivery_count(), 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn scenario_quiet_hours_denies_one_channel() {
    let pipeline = Pipeline::start().await;
    pipeline
        .store
        .upsert_user(&User::new("u3", "carol@ex.com"))
        .await
        .unwrap();

    // A window centred on the current UTC time; wraps midnight when the
    // test runs near it.
    let now = Utc::now();
    let start = (now - chrono::Duration::hours(1)).time().with_nanosecond(0).unwrap();
    let end = (now + chrono::Duration::hours(1)).time().with_nanosecond(0).unwrap();
    pipeline
        .store
        .upsert_preference(
            &Preference::new("u3", Channel::Email, EventType::Account)
                .with_quiet_hours(start, end),
        )
        .await
        .unwrap();

    pipeline
        .submit(submitted_event("e3", "account", "u3", &["email", "in_app"]))
        .await;

    // The in-app channel is unaffected and delivers.
    pipeline
        .wait_for("in-app delivery", |p| p.store.delivery_count() == 1)
        .await;
    pipeline.settle().await;

    let rows = pipeline.store.deliveries_for_event("e3").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].channel, Channel::InApp);

    assert_eq!(
        pipeline
            .broker
            .published_count(&subjects::routed(Channel::Email)),
        0
    );

    pipeline.stop().await;
}

#[tokio::test]
async fn scenario_retry_then_dead_letter() {
    // Transport fails more times than the retry budget.
    let transport = Arc::new(MockTransport::failing(4));
    let pipeline = Pipeline::start_with_email_transport(transport.clone()).await;
    pipeline
        .store
        .upsert_user(&User::new("u4", "dan@ex.com"))
        .await
        .unwrap();

    pipeline
        .submit(submitted_event("e5", "account", "u4", &["email"]))
        .await;

    pipeline
        .wait_for("failed delivery row", |p| p.store.delivery_count() == 1)
        .await;
    pipeline.settle().await;

    // Three attempts (redelivery counts 0, 1, 2), then the DLQ.
    assert_eq!(transport.sends(), 3);

    let rows = pipeline.store.deliveries_for_event("e5").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, DeliveryStatus::Failed);
    assert_eq!(rows[0].attempt_count, 3);
    assert!(rows[0].error.as_deref().unwrap().contains("scripted failure"));

    assert_eq!(pipeline.broker.published_count(subjects::DLQ), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn scenario_rate_limit_caps_at_ten_per_window() {
    let pipeline = Pipeline::start().await;
    pipeline
        .store
        .upsert_user(&User::new("u6", "eve@ex.com"))
        .await
        .unwrap();

    for i in 1..=11 {
        pipeline
            .submit(submitted_event(
                &format!("rate-{i}"),
                "account",
                "u6",
                &["email"],
            ))
            .await;
    }

    pipeline
        .wait_for("ten deliveries", |p| p.store.delivery_count() >= 10)
        .await;
    pipeline.settle().await;

    // First ten allowed, the eleventh denied by the sliding window.
    assert_eq!(pipeline.store.delivery_count(), 10);

    let key = keys::rate_limit("u6", Channel::Email, EventType::Account);
    assert_eq!(pipeline.cache.get_counter(&key).await.unwrap(), Some(11));
    assert!(pipeline.cache.ttl(&key).await.unwrap().unwrap() > Duration::ZERO);

    // The analytics reader sees the ten successful deliveries.
    let reader = AnalyticsReader::new(pipeline.store.clone());
    let report = reader.get_analytics(1).await.unwrap();
    assert_eq!(report.total_deliveries, 10);
    assert_eq!(report.success_rate, 100.0);
    assert_eq!(report.channel_metrics.len(), 1);
    assert_eq!(report.top_event_types[0].event_type, EventType::Account);

    pipeline.stop().await;
}

#[tokio::test]
async fn unknown_user_flows_to_dlq_on_contact_channel() {
    // No user row at all: enrichment proceeds without contact fields and
    // the email transport's precondition fails through to the DLQ.
    let pipeline = Pipeline::start().await;

    pipeline
        .submit(submitted_event("e7", "system", "ghost", &["email"]))
        .await;

    pipeline
        .wait_for("failed delivery row", |p| p.store.delivery_count() == 1)
        .await;

    let rows = pipeline.store.deliveries_for_event("e7").await.unwrap();
    assert_eq!(rows[0].status, DeliveryStatus::Failed);
    assert!(rows[0]
        .error
        .as_deref()
        .unwrap()
        .contains("missing contact field"));
    assert_eq!(pipeline.broker.published_count(subjects::DLQ), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn in_app_delivery_broadcasts_for_fanout() {
    let pipeline = Pipeline::start().await;
    let mut rx = pipeline.cache.subscribe();
    pipeline
        .store
        .upsert_user(&User::new("u8", "fay@ex.com"))
        .await
        .unwrap();

    pipeline
        .submit(submitted_event("e8", "system", "u8", &["in_app"]))
        .await;

    pipeline
        .wait_for("in-app delivery", |p| p.store.delivery_count() == 1)
        .await;

    let broadcast = rx.recv().await.unwrap();
    assert_eq!(broadcast.channel, keys::BROADCAST);
    let payload: serde_json::Value = serde_json::from_str(&broadcast.payload).unwrap();
    assert_eq!(payload["user_id"], "u8");
    assert_eq!(payload["notification"]["event_id"], "e8");

    pipeline.stop().await;
}
