//! notifyd is the event-processing core of a multi-channel notification
//! platform.
//!
//! Events submitted by an external HTTP layer flow through a staged,
//! at-least-once pipeline carried by a durable broker:
//!
//! ```text
//! notifications.events ──> Ingestion ──> notifications.enriched
//!                                              │
//!                                       Preference filter
//!                                              │
//!                         notifications.routed.<channel>  (one per allowed channel)
//!                                              │
//!                                          Renderer
//!                                              │
//!                         notifications.delivery.<channel>
//!                                              │
//!                                       Delivery worker ──> notifications.dlq
//!                                              │
//!                                       delivery audit rows
//! ```
//!
//! Shared state lives behind three seams: [`broker::Broker`] (durable
//! subjects with per-consumer cursors), [`store::Store`] (users,
//! preferences, templates, deliveries) and [`cache::Ephemeral`] (dedup
//! set, rate-limit counters, in-app broadcast). Each seam ships a memory
//! backend for development and tests next to its production backend.

pub mod analytics;
pub mod bootstrap;
pub mod broker;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod event;
pub mod pipeline;
pub mod store;
pub mod telemetry;
