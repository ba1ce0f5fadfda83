//! The first three pipeline stages.
//!
//! Each stage is a long-lived pull loop against one broker subject:
//!
//! - [`IngestionStage`]: `notifications.events` → validate, dedup,
//!   enrich → `notifications.enriched`
//! - [`PreferenceStage`]: `notifications.enriched` → per-channel
//!   allow/deny → `notifications.routed.<channel>`
//! - [`RenderStage`] (one per channel): `notifications.routed.<channel>`
//!   → template render → `notifications.delivery.<channel>`
//!
//! Batches are processed sequentially; parallelism comes from running
//! stage replicas that share a durable consumer.

mod ingestion;
mod preferences;
mod renderer;
pub mod template;

pub use ingestion::IngestionStage;
pub use preferences::{in_quiet_hours, ChannelDecision, Denial, PreferenceStage};
pub use renderer::RenderStage;
