//! Cooperative shutdown.
//!
//! Stages subscribe to a watch channel and exit their pull loop after
//! the in-flight batch completes. In-flight broker messages that were
//! neither acked nor nak'd are redelivered after the ack timeout.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Normal operation
    Running,
    /// Stop fetching, finish the in-flight batch, exit
    Draining,
}

/// Shutdown signal shared by every stage in the process.
pub struct Shutdown {
    state: watch::Sender<ShutdownState>,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(ShutdownState::Running);
        Arc::new(Self { state })
    }

    /// Current state.
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Begin draining (idempotent).
    pub fn trigger(&self) {
        if self.state() == ShutdownState::Running {
            info!("shutdown triggered, draining stages");
            let _ = self.state.send(ShutdownState::Draining);
        }
    }
}

/// Trigger shutdown on SIGINT or SIGTERM.
pub async fn listen_for_signals(shutdown: Arc<Shutdown>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }

    shutdown.trigger();
}
