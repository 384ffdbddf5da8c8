//! Periodic reconciliation loops
//!
//! Each loop is a [`Reconciler`] driven by [`spawn_reconciler`] on its own
//! fixed-interval ticker. Loops never coordinate directly; a sweep processes
//! items one at a time and a failing item never aborts the rest of the sweep.

pub mod billing;
pub mod lifecycle;
pub mod status_sync;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::NimbusResult;

pub use billing::BillingReconciler;
pub use lifecycle::LifecycleReconciler;
pub use status_sync::StatusSyncReconciler;
pub use task::TaskReconciler;

/// Outcome counters of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub changed: usize,
    pub failed: usize,
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scanned={} changed={} failed={}", self.scanned, self.changed, self.failed)
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn sweep(&self) -> NimbusResult<SweepReport>;
}

/// Run `reconciler` every `interval()` until `shutdown` fires.
///
/// The first sweep runs immediately. Ticks missed while a sweep overran are skipped.
pub fn spawn_reconciler(reconciler: Arc<dyn Reconciler>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = reconciler.name();
        let mut ticker = interval(reconciler.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("{} started with interval {:?}", name, reconciler.interval());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("{} shutting down", name);
                    break;
                }
                _ = ticker.tick() => {
                    match reconciler.sweep().await {
                        Ok(report) => info!("{} sweep finished: {}", name, report),
                        Err(e) => error!("{} sweep failed: {}", name, e),
                    }
                }
            }
        }
    })
}

/// Owns the running loops and stops them together
pub struct ReconcilerSet {
    shutdown: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ReconcilerSet {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn spawn(&mut self, reconciler: Arc<dyn Reconciler>) {
        let name = reconciler.name();
        let handle = spawn_reconciler(reconciler, self.shutdown.clone());
        self.handles.push((name, handle));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every loop and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!("{} exited abnormally: {}", name, e);
            }
        }
    }
}
