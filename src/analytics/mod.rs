//! Read-only aggregates over the delivery audit log.

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::event::{Channel, EventType};
use crate::store::{Delivery, SharedStore, StoreError};

/// Success/failure metrics for one channel within the window.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelMetrics {
    pub channel: Channel,
    pub total: i64,
    pub delivered: i64,
    pub failed: i64,
    /// Percentage, rounded to 2 decimals
    pub success_rate: f64,
    pub avg_attempts: f64,
}

/// Event-type frequency within the window.
#[derive(Debug, Clone, Serialize)]
pub struct EventTypeCount {
    pub event_type: EventType,
    pub count: i64,
}

/// Rolling-window delivery report.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    /// Window description, e.g. "24h"
    pub period: String,
    pub total_deliveries: i64,
    /// Percentage of rows with status `delivered`, rounded to 2 decimals;
    /// 0 when the window is empty
    pub success_rate: f64,
    pub channel_metrics: Vec<ChannelMetrics>,
    /// Top 10 event types by delivery count
    pub top_event_types: Vec<EventTypeCount>,
}

/// How many event types a report lists.
const TOP_EVENT_TYPES: i64 = 10;

/// Read-only aggregator. All methods are pure queries.
pub struct AnalyticsReader {
    store: SharedStore,
}

impl AnalyticsReader {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Aggregate the last `period_hours` of deliveries.
    pub async fn get_analytics(&self, period_hours: i64) -> Result<AnalyticsReport, StoreError> {
        let since = Utc::now() - Duration::hours(period_hours);

        let tallies = self.store.channel_tallies(since).await?;
        let total: i64 = tallies.iter().map(|t| t.total).sum();
        let delivered: i64 = tallies.iter().map(|t| t.delivered).sum();

        let channel_metrics = tallies
            .into_iter()
            .map(|t| ChannelMetrics {
                channel: t.channel,
                total: t.total,
                delivered: t.delivered,
                failed: t.failed,
                success_rate: percentage(t.delivered, t.total),
                avg_attempts: round2(t.avg_attempts),
            })
            .collect();

        let top_event_types = self
            .store
            .event_type_tallies(since, TOP_EVENT_TYPES)
            .await?
            .into_iter()
            .map(|t| EventTypeCount {
                event_type: t.event_type,
                count: t.count,
            })
            .collect();

        Ok(AnalyticsReport {
            period: format!("{period_hours}h"),
            total_deliveries: total,
            success_rate: percentage(delivered, total),
            channel_metrics,
            top_event_types,
        })
    }

    /// Up to `limit` deliveries for one user, newest first.
    pub async fn get_user_deliveries(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Delivery>, StoreError> {
        self.store.deliveries_for_user(user_id, limit).await
    }

    /// Terminal failures, newest first.
    pub async fn get_failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, StoreError> {
        self.store.failed_deliveries(limit).await
    }

    /// Every attempt recorded for one event, oldest first.
    pub async fn get_deliveries_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Vec<Delivery>, StoreError> {
        self.store.deliveries_for_event(event_id).await
    }
}

fn percentage(part: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(part as f64 / total as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
