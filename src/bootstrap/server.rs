//! Process bootstrap.
//!
//! Connects the three shared-state seams once, injects them into the
//! configured stages, runs until a shutdown signal, then drains. A
//! production deployment runs one role per process; `all` exists for
//! development and tests.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::broker;
use crate::cache;
use crate::config::Config;
use crate::delivery::{default_transport, DeliveryWorker};
use crate::event::Channel;
use crate::pipeline::{IngestionStage, PreferenceStage, RenderStage};
use crate::store;
use crate::telemetry::{Metrics, MetricsConfig};

use super::shutdown::{listen_for_signals, Shutdown};

/// Which stages this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Ingestion,
    Preferences,
    Renderers,
    Workers,
    All,
}

impl FromStr for StageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingestion" => Ok(Self::Ingestion),
            "preferences" => Ok(Self::Preferences),
            "renderers" => Ok(Self::Renderers),
            "workers" => Ok(Self::Workers),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown stage '{other}' (expected ingestion, preferences, renderers, workers or all)"
            )),
        }
    }
}

/// Main notifyd server.
pub struct Server {
    config: Arc<Config>,
    roles: Vec<StageRole>,
}

impl Server {
    pub fn new(config: Config, roles: Vec<StageRole>) -> Self {
        Self {
            config: Arc::new(config),
            roles,
        }
    }

    fn runs(&self, role: StageRole) -> bool {
        self.roles.contains(&role) || self.roles.contains(&StageRole::All)
    }

    /// Run the server until shutdown. Returns `Err` (exit code 1) only
    /// on startup/init failure.
    pub async fn run(self) -> Result<()> {
        let shutdown = Shutdown::new();
        tokio::spawn(listen_for_signals(shutdown.clone()));

        // Metrics/admin surface first, so init failures are observable.
        let metrics = Metrics::new(&MetricsConfig {
            address: self.config.admin.address,
        })?;
        let admin_state = metrics.admin_state();
        let metrics_handle = if self.config.admin.enabled {
            let metrics = metrics.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = metrics.serve().await {
                    error!(error = %e, "metrics server failed");
                }
            }))
        } else {
            None
        };

        // Shared seams, constructed once and injected into every stage.
        let broker = broker::connect(&self.config.broker).await?;
        let store = store::connect(&self.config.database).await?;
        let cache = cache::connect(&self.config.cache).await?;

        let mut stages = Vec::new();

        if self.runs(StageRole::Ingestion) {
            let stage = IngestionStage::new(
                broker.clone(),
                store.clone(),
                cache.clone(),
                self.config.pipeline.clone(),
                shutdown.clone(),
            );
            stages.push(spawn_stage("ingestion", shutdown.clone(), stage.run()));
        }

        if self.runs(StageRole::Preferences) {
            let stage = PreferenceStage::new(
                broker.clone(),
                store.clone(),
                cache.clone(),
                self.config.pipeline.clone(),
                shutdown.clone(),
            );
            stages.push(spawn_stage("preferences", shutdown.clone(), stage.run()));
        }

        if self.runs(StageRole::Renderers) {
            for channel in Channel::ALL {
                let stage = RenderStage::new(
                    channel,
                    broker.clone(),
                    store.clone(),
                    self.config.pipeline.clone(),
                    shutdown.clone(),
                );
                stages.push(spawn_stage("renderer", shutdown.clone(), stage.run()));
            }
        }

        if self.runs(StageRole::Workers) {
            for channel in Channel::ALL {
                let worker = DeliveryWorker::new(
                    channel,
                    broker.clone(),
                    store.clone(),
                    cache.clone(),
                    default_transport(channel),
                    self.config.delivery.clone(),
                    self.config.pipeline.fetch_expires(),
                    shutdown.clone(),
                );
                stages.push(spawn_stage("worker", shutdown.clone(), worker.run()));
            }
        }

        if stages.is_empty() {
            anyhow::bail!("no stages selected");
        }

        admin_state.set_ready(true);
        info!(
            stages = stages.len(),
            admin = %self.config.admin.address,
            "notifyd started"
        );

        // Stages exit on their own once shutdown triggers.
        for handle in stages {
            let _ = handle.await;
        }

        admin_state.set_ready(false);
        if let Some(handle) = metrics_handle {
            handle.abort();
        }

        info!("notifyd stopped");
        Ok(())
    }
}

/// Spawn a stage task. A stage that errors out takes the process down
/// through the shutdown signal rather than leaving a silent gap in the
/// pipeline.
fn spawn_stage(
    name: &'static str,
    shutdown: Arc<Shutdown>,
    fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(stage = name, error = %e, "stage failed");
            shutdown.trigger();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_role_parsing() {
        assert_eq!("ingestion".parse::<StageRole>().unwrap(), StageRole::Ingestion);
        assert_eq!("workers".parse::<StageRole>().unwrap(), StageRole::Workers);
        assert_eq!("all".parse::<StageRole>().unwrap(), StageRole::All);
        assert!("webserver".parse::<StageRole>().is_err());
    }

    #[test]
    fn test_all_implies_every_role() {
        let server = Server::new(Config::default(), vec![StageRole::All]);
        assert!(server.runs(StageRole::Ingestion));
        assert!(server.runs(StageRole::Preferences));
        assert!(server.runs(StageRole::Renderers));
        assert!(server.runs(StageRole::Workers));
    }

    #[test]
    fn test_single_role_is_exclusive() {
        let server = Server::new(Config::default(), vec![StageRole::Workers]);
        assert!(server.runs(StageRole::Workers));
        assert!(!server.runs(StageRole::Ingestion));
    }
}
