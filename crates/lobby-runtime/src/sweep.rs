//! Background loops: status reconciliation, resource sampling, and overlay
//! cleanup. Each loop sleeps its own interval and stops on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use lobby_core::config::LobbyConfig;

use crate::process::ProcessSupervisor;
use crate::vpn::VpnManager;

/// Handles to the running sweep tasks.
pub struct SweepHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SweepHandle {
    /// Signal every loop and wait for them to finish their current pass.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Background sweeps stopped");
    }
}

/// Start the reconcile, sampling, and cleanup loops.
pub fn spawn_sweeps(
    supervisor: Arc<ProcessSupervisor>,
    vpn: Arc<VpnManager>,
    config: &LobbyConfig,
) -> SweepHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::with_capacity(3);

    let sup = Arc::clone(&supervisor);
    tasks.push(spawn_loop(
        "reconcile",
        Duration::from_secs(config.supervisor.poll_interval_secs),
        shutdown_rx.clone(),
        move || {
            let sup = Arc::clone(&sup);
            async move {
                let records = sup.update_all_process_statuses().await;
                debug!(processes = records.len(), "Reconciled process statuses");
            }
        },
    ));

    let sup = Arc::clone(&supervisor);
    tasks.push(spawn_loop(
        "metrics",
        Duration::from_secs(config.supervisor.metrics_interval_secs),
        shutdown_rx.clone(),
        move || {
            let sup = Arc::clone(&sup);
            async move {
                let sampled = sup.sample_metrics().await;
                debug!(sampled, "Sampled process resources");
            }
        },
    ));

    tasks.push(spawn_loop(
        "vpn-cleanup",
        Duration::from_secs(config.vpn.cleanup_interval_secs),
        shutdown_rx,
        move || {
            let vpn = Arc::clone(&vpn);
            async move {
                let removed = vpn.cleanup_inactive_sessions().await;
                if !removed.is_empty() {
                    info!(removed = removed.len(), "Cleaned up inactive overlay networks");
                }
            }
        },
    ));

    info!(
        poll_secs = config.supervisor.poll_interval_secs,
        metrics_secs = config.supervisor.metrics_interval_secs,
        cleanup_secs = config.vpn.cleanup_interval_secs,
        "Background sweeps started"
    );
    SweepHandle { shutdown_tx, tasks }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => pass().await,
                _ = shutdown.changed() => {
                    debug!(sweep = name, "Sweep shutting down");
                    break;
                }
            }
        }
    })
}
