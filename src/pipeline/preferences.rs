//! Preference filter stage.
//!
//! For each channel an enriched event requests, decides allow/deny using
//! stored preferences, quiet hours and a sliding rate limit, then
//! publishes one routed event per allowed channel.
//!
//! Rules are evaluated in order and the first denial wins:
//!
//! 1. marketing events with no preference row are denied (default-deny
//!    for marketing, default-allow for transactional types)
//! 2. an explicitly disabled preference denies
//! 3. quiet hours (UTC, window may wrap midnight) deny
//! 4. the sliding rate limit denies once the counter exceeds the limit;
//!    the counter advances only when evaluation reaches this rule

use std::sync::Arc;

use chrono::{NaiveTime, Utc};
use tracing::{debug, info, warn};

use crate::bootstrap::{Shutdown, ShutdownState};
use crate::broker::{publish_json, subjects, BrokerMessage, SharedBroker};
use crate::cache::{bump_rate_limit, Ephemeral, SharedEphemeral};
use crate::config::PipelineConfig;
use crate::event::{Channel, EnrichedEvent, EventType, RoutedEvent};
use crate::store::{SharedStore, Store};

/// Why a channel was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// Marketing event with no preference row
    MarketingDefault,
    /// Preference exists with `enabled = false`
    Disabled,
    /// Inside the user's quiet-hours window
    QuietHours,
    /// Sliding window count exceeded the limit
    RateLimited,
}

impl Denial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketingDefault => "marketing_default",
            Self::Disabled => "disabled",
            Self::QuietHours => "quiet_hours",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Outcome of the decision algorithm for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDecision {
    Allow,
    Deny(Denial),
}

/// Quiet-hours predicate, UTC times of day. When `end < start` the
/// window wraps midnight.
pub fn in_quiet_hours(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if end < start {
        now >= start || now < end
    } else {
        start <= now && now < end
    }
}

/// Evaluate the decision algorithm for one (user, channel, event type).
///
/// Infrastructure failures bubble up as `Err`; the caller naks and the
/// broker redelivers.
pub async fn decide_channel(
    store: &dyn Store,
    cache: &dyn Ephemeral,
    config: &PipelineConfig,
    user_id: &str,
    channel: Channel,
    event_type: EventType,
    now: NaiveTime,
) -> anyhow::Result<ChannelDecision> {
    let preference = store.get_preference(user_id, channel, event_type).await?;

    match &preference {
        None => {
            if event_type == EventType::Marketing {
                return Ok(ChannelDecision::Deny(Denial::MarketingDefault));
            }
        }
        Some(preference) => {
            if !preference.enabled {
                return Ok(ChannelDecision::Deny(Denial::Disabled));
            }
            if let (Some(start), Some(end)) =
                (preference.quiet_hours_start, preference.quiet_hours_end)
            {
                if in_quiet_hours(now, start, end) {
                    return Ok(ChannelDecision::Deny(Denial::QuietHours));
                }
            }
        }
    }

    // Rule 4 is stateful: the counter advances on every evaluation that
    // reaches it, including the one that denies.
    let count = bump_rate_limit(
        cache,
        user_id,
        channel,
        event_type,
        config.rate_limit_ttl(),
    )
    .await?;
    if count > config.rate_limit {
        return Ok(ChannelDecision::Deny(Denial::RateLimited));
    }

    Ok(ChannelDecision::Allow)
}

pub struct PreferenceStage {
    broker: SharedBroker,
    store: SharedStore,
    cache: SharedEphemeral,
    config: PipelineConfig,
    shutdown: Arc<Shutdown>,
}

impl PreferenceStage {
    pub fn new(
        broker: SharedBroker,
        store: SharedStore,
        cache: SharedEphemeral,
        config: PipelineConfig,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            broker,
            store,
            cache,
            config,
            shutdown,
        }
    }

    /// Run the pull loop until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut consumer = self
            .broker
            .consumer(subjects::ENRICHED, subjects::PREFERENCES_CONSUMER, -1)
            .await?;

        info!(
            batch = self.config.preferences_batch,
            rate_limit = self.config.rate_limit,
            "preference filter started"
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow_and_update() != ShutdownState::Running {
                        info!("preference filter shutting down");
                        break;
                    }
                }

                batch = consumer.fetch(self.config.preferences_batch, self.config.fetch_expires()) => {
                    match batch {
                        Ok(messages) => {
                            for message in messages {
                                self.process(message).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "preference fetch failed");
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn process(&self, message: BrokerMessage) {
        let event: EnrichedEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping undecodable enriched event");
                ack(message).await;
                return;
            }
        };

        let now = Utc::now().time();
        let mut allowed = Vec::new();

        for &channel in &event.channels {
            match decide_channel(
                self.store.as_ref(),
                self.cache.as_ref(),
                &self.config,
                &event.user_id,
                channel,
                event.event_type,
                now,
            )
            .await
            {
                Ok(ChannelDecision::Allow) => allowed.push(channel),
                Ok(ChannelDecision::Deny(denial)) => {
                    debug!(
                        event_id = %event.event_id,
                        user_id = %event.user_id,
                        channel = %channel,
                        reason = denial.as_str(),
                        "channel denied"
                    );
                }
                Err(e) => {
                    warn!(event_id = %event.event_id, error = %e, "preference decision failed");
                    nak(message).await;
                    return;
                }
            }
        }

        if allowed.is_empty() {
            info!(
                event_id = %event.event_id,
                user_id = %event.user_id,
                "all requested channels denied"
            );
            ack(message).await;
            return;
        }

        for &channel in &allowed {
            let routed = RoutedEvent::for_channel(&event, channel);
            if let Err(e) =
                publish_json(self.broker.as_ref(), &subjects::routed(channel), &routed).await
            {
                warn!(
                    event_id = %event.event_id,
                    channel = %channel,
                    error = %e,
                    "routed publish failed"
                );
                nak(message).await;
                return;
            }
        }

        debug!(
            event_id = %event.event_id,
            channels = allowed.len(),
            "event routed"
        );
        ack(message).await;
    }
}

async fn ack(message: BrokerMessage) {
    if let Err(e) = message.ack().await {
        warn!(error = %e, "ack failed");
    }
}

async fn nak(message: BrokerMessage) {
    if let Err(e) = message.nak().await {
        warn!(error = %e, "nak failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{keys, MemoryEphemeral};
    use crate::store::{MemoryStore, Preference};

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_quiet_hours_plain_window() {
        let start = t(9, 0, 0);
        let end = t(17, 0, 0);

        assert!(!in_quiet_hours(t(8, 59, 59), start, end));
        assert!(in_quiet_hours(t(9, 0, 0), start, end));
        assert!(in_quiet_hours(t(12, 0, 0), start, end));
        assert!(in_quiet_hours(t(16, 59, 59), start, end));
        assert!(!in_quiet_hours(t(17, 0, 0), start, end));
    }

    #[test]
    fn test_quiet_hours_wraps_midnight() {
        let start = t(22, 0, 0);
        let end = t(8, 0, 0);

        assert!(in_quiet_hours(t(23, 30, 0), start, end));
        assert!(in_quiet_hours(t(3, 0, 0), start, end));
        assert!(in_quiet_hours(t(22, 0, 0), start, end));
        assert!(!in_quiet_hours(t(8, 0, 0), start, end));
        assert!(!in_quiet_hours(t(12, 0, 0), start, end));
        assert!(!in_quiet_hours(t(21, 59, 59), start, end));
    }

    #[test]
    fn test_quiet_hours_equal_bounds_is_empty_window() {
        let at = t(10, 0, 0);
        assert!(!in_quiet_hours(t(10, 0, 0), at, at));
        assert!(!in_quiet_hours(t(23, 0, 0), at, at));
    }

    struct Fixture {
        store: MemoryStore,
        cache: MemoryEphemeral,
        config: PipelineConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                cache: MemoryEphemeral::new(),
                config: PipelineConfig::default(),
            }
        }

        async fn decide(
            &self,
            channel: Channel,
            event_type: EventType,
            now: NaiveTime,
        ) -> ChannelDecision {
            decide_channel(
                &self.store,
                &self.cache,
                &self.config,
                "u1",
                channel,
                event_type,
                now,
            )
            .await
            .unwrap()
        }

        async fn counter(&self, channel: Channel, event_type: EventType) -> Option<i64> {
            self.cache
                .get_counter(&keys::rate_limit("u1", channel, event_type))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_no_preference_allows_transactional() {
        let f = Fixture::new();
        let decision = f.decide(Channel::Email, EventType::Account, t(12, 0, 0)).await;
        assert_eq!(decision, ChannelDecision::Allow);
    }

    #[tokio::test]
    async fn test_marketing_denied_by_default() {
        let f = Fixture::new();
        let decision = f
            .decide(Channel::Email, EventType::Marketing, t(12, 0, 0))
            .await;
        assert_eq!(decision, ChannelDecision::Deny(Denial::MarketingDefault));
        // Rules 1-3 denials never touch the counter.
        assert_eq!(f.counter(Channel::Email, EventType::Marketing).await, None);
    }

    #[tokio::test]
    async fn test_marketing_allowed_with_preference_row() {
        let f = Fixture::new();
        f.store
            .upsert_preference(&Preference::new("u1", Channel::Email, EventType::Marketing))
            .await
            .unwrap();

        let decision = f
            .decide(Channel::Email, EventType::Marketing, t(12, 0, 0))
            .await;
        assert_eq!(decision, ChannelDecision::Allow);
    }

    #[tokio::test]
    async fn test_disabled_preference_denies_without_counting() {
        let f = Fixture::new();
        f.store
            .upsert_preference(
                &Preference::new("u1", Channel::Sms, EventType::Account).disabled(),
            )
            .await
            .unwrap();

        let decision = f.decide(Channel::Sms, EventType::Account, t(12, 0, 0)).await;
        assert_eq!(decision, ChannelDecision::Deny(Denial::Disabled));
        assert_eq!(f.counter(Channel::Sms, EventType::Account).await, None);
    }

    #[tokio::test]
    async fn test_quiet_hours_denies_at_utc_time() {
        let f = Fixture::new();
        f.store
            .upsert_preference(
                &Preference::new("u1", Channel::Email, EventType::Account)
                    .with_quiet_hours(t(22, 0, 0), t(8, 0, 0)),
            )
            .await
            .unwrap();

        // 03:00 UTC is inside the wrapped window.
        let decision = f.decide(Channel::Email, EventType::Account, t(3, 0, 0)).await;
        assert_eq!(decision, ChannelDecision::Deny(Denial::QuietHours));
        assert_eq!(f.counter(Channel::Email, EventType::Account).await, None);

        // Midday is outside it.
        let decision = f.decide(Channel::Email, EventType::Account, t(12, 0, 0)).await;
        assert_eq!(decision, ChannelDecision::Allow);
    }

    #[tokio::test]
    async fn test_rate_limit_denies_after_ten_and_keeps_counting() {
        let f = Fixture::new();
        let noon = t(12, 0, 0);

        for i in 1..=10 {
            let decision = f.decide(Channel::Email, EventType::Account, noon).await;
            assert_eq!(decision, ChannelDecision::Allow, "send {i} should pass");
        }

        let decision = f.decide(Channel::Email, EventType::Account, noon).await;
        assert_eq!(decision, ChannelDecision::Deny(Denial::RateLimited));

        // The denying evaluation still advanced the window counter.
        assert_eq!(f.counter(Channel::Email, EventType::Account).await, Some(11));
        assert!(f
            .cache
            .ttl(&keys::rate_limit("u1", Channel::Email, EventType::Account))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_keys_are_per_channel_and_type() {
        let f = Fixture::new();
        let noon = t(12, 0, 0);

        for _ in 0..10 {
            f.decide(Channel::Email, EventType::Account, noon).await;
        }
        assert_eq!(
            f.decide(Channel::Email, EventType::Account, noon).await,
            ChannelDecision::Deny(Denial::RateLimited)
        );

        // A different channel has an untouched window.
        assert_eq!(
            f.decide(Channel::Sms, EventType::Account, noon).await,
            ChannelDecision::Allow
        );
        // So does a different event type on the same channel.
        assert_eq!(
            f.decide(Channel::Email, EventType::Security, noon).await,
            ChannelDecision::Allow
        );
    }
}
