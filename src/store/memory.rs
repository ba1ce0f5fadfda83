//! In-memory store for development and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ChannelTally, Delivery, DeliveryStatus, EventTypeTally, Preference, Store, StoreError,
    Template, User,
};
use crate::event::{Channel, EventType};

/// In-memory store. Clones on read, append-only deliveries.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, User>>,
    preferences: Mutex<HashMap<(String, Channel, EventType), Preference>>,
    templates: Mutex<HashMap<(Channel, EventType), Template>>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total delivery rows. Test helper.
    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.lock().unwrap().get(user_id).cloned())
    }

    async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        self.users
            .lock()
            .unwrap()
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_preference(
        &self,
        user_id: &str,
        channel: Channel,
        event_type: EventType,
    ) -> Result<Option<Preference>, StoreError> {
        Ok(self
            .preferences
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), channel, event_type))
            .cloned())
    }

    async fn upsert_preference(&self, preference: &Preference) -> Result<(), StoreError> {
        self.preferences.lock().unwrap().insert(
            (
                preference.user_id.clone(),
                preference.channel,
                preference.event_type,
            ),
            preference.clone(),
        );
        Ok(())
    }

    async fn get_template(
        &self,
        channel: Channel,
        event_type: EventType,
    ) -> Result<Option<Template>, StoreError> {
        Ok(self
            .templates
            .lock()
            .unwrap()
            .get(&(channel, event_type))
            .cloned())
    }

    async fn upsert_template(&self, template: &Template) -> Result<(), StoreError> {
        self.templates
            .lock()
            .unwrap()
            .insert((template.channel, template.event_type), template.clone());
        Ok(())
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StoreError> {
        self.deliveries.lock().unwrap().push(delivery.clone());
        Ok(())
    }

    async fn channel_tallies(&self, since: DateTime<Utc>) -> Result<Vec<ChannelTally>, StoreError> {
        let deliveries = self.deliveries.lock().unwrap();
        let mut tallies: HashMap<Channel, (i64, i64, i64, i64)> = HashMap::new();

        for d in deliveries.iter().filter(|d| d.created_at >= since) {
            let entry = tallies.entry(d.channel).or_default();
            entry.0 += 1;
            if d.status == DeliveryStatus::Delivered {
                entry.1 += 1;
            }
            if d.status == DeliveryStatus::Failed {
                entry.2 += 1;
            }
            entry.3 += i64::from(d.attempt_count);
        }

        let mut out: Vec<ChannelTally> = tallies
            .into_iter()
            .map(|(channel, (total, delivered, failed, attempts))| ChannelTally {
                channel,
                total,
                delivered,
                failed,
                avg_attempts: attempts as f64 / total as f64,
            })
            .collect();
        out.sort_by_key(|t| t.channel);
        Ok(out)
    }

    async fn event_type_tallies(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventTypeTally>, StoreError> {
        let deliveries = self.deliveries.lock().unwrap();
        let mut counts: HashMap<EventType, i64> = HashMap::new();
        for d in deliveries.iter().filter(|d| d.created_at >= since) {
            *counts.entry(d.event_type).or_default() += 1;
        }

        let mut out: Vec<EventTypeTally> = counts
            .into_iter()
            .map(|(event_type, count)| EventTypeTally { event_type, count })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then(a.event_type.cmp(&b.event_type)));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn deliveries_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Delivery>, StoreError> {
        let deliveries = self.deliveries.lock().unwrap();
        let mut out: Vec<Delivery> = deliveries
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, StoreError> {
        let deliveries = self.deliveries.lock().unwrap();
        let mut out: Vec<Delivery> = deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Failed)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn deliveries_for_event(&self, event_id: &str) -> Result<Vec<Delivery>, StoreError> {
        let deliveries = self.deliveries.lock().unwrap();
        let mut out: Vec<Delivery> = deliveries
            .iter()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}
