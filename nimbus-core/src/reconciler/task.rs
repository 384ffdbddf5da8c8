//! Task reconciler
//!
//! Polls the control plane for every pending or running task that carries a
//! remote task id and moves the local task forward. Status only ever
//! advances (`pending < running < success|failed`), so re-polling a settled
//! task never repeats its side effects. Afterwards it re-dispatches create
//! tasks that were paid for but never reached the control plane.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Reconciler, SweepReport};
use crate::control_plane::ControlPlane;
use crate::error::NimbusResult;
use crate::order_saga::{chrono_duration, settle_failure, settle_success, OrderSaga};
use crate::storage::Store;
use crate::types::{Instance, InstanceStatus, Task, TaskKind, TaskStatus};

pub struct TaskReconciler {
    store: Store,
    control_plane: Arc<dyn ControlPlane>,
    saga: Arc<OrderSaga>,
    interval: Duration,
    dispatch_grace: Duration,
    provision_period: Duration,
    cancel: CancellationToken,
}

impl TaskReconciler {
    pub fn new(
        store: Store,
        control_plane: Arc<dyn ControlPlane>,
        saga: Arc<OrderSaga>,
        interval: Duration,
        dispatch_grace: Duration,
        provision_period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            control_plane,
            saga,
            interval,
            dispatch_grace,
            provision_period,
            cancel,
        }
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> NimbusResult<SweepReport> {
        let mut report = SweepReport::default();

        let tasks = self
            .store
            .read("scan open tasks", |txn| {
                txn.scan(|t: &Task| {
                    matches!(t.status, TaskStatus::Pending | TaskStatus::Running) && !t.external_task_id.is_empty()
                })
            })
            .await?;

        for task in tasks {
            report.scanned += 1;
            let remote = match self.control_plane.get_task_status(&task.external_task_id, &self.cancel).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!("Polling task {} ({}) failed: {}", task.id, task.external_task_id, e);
                    report.failed += 1;
                    continue;
                }
            };

            let status = match remote.status.parse::<TaskStatus>() {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        "Task {} reported unknown status '{}', skipping",
                        task.id, remote.status
                    );
                    continue;
                }
            };
            let progress = remote.progress.clamp(0, 100) as u8;

            match self.apply(task.id, status, progress, &remote.message, now).await {
                Ok(true) => report.changed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Updating task {} failed: {}", task.id, e);
                    report.failed += 1;
                }
            }
        }

        let recovered = self.recover_undispatched(now).await?;
        report.scanned += recovered.scanned;
        report.changed += recovered.changed;
        report.failed += recovered.failed;

        Ok(report)
    }

    async fn apply(
        &self,
        task_id: u64,
        status: TaskStatus,
        progress: u8,
        message: &str,
        now: DateTime<Utc>,
    ) -> NimbusResult<bool> {
        let period = self.provision_period;
        self.store
            .write("apply task status", |txn| {
                let mut task = txn.require::<Task>(task_id)?;
                if !task.status.can_advance_to(status) {
                    debug!("Task {} ignores backwards move {} -> {}", task.id, task.status, status);
                    return Ok(false);
                }

                match status {
                    TaskStatus::Success => {
                        settle_success(txn, &mut task, "", period, now)?;
                        if task.order_ref.is_none() {
                            if let Some(instance_id) = task.instance_ref {
                                activate_instance(txn, instance_id, now)?;
                            }
                        }
                        info!("Task {} ({}) succeeded", task.id, task.kind);
                        Ok(true)
                    }
                    TaskStatus::Failed => {
                        let message = if message.is_empty() {
                            "control plane reported failure"
                        } else {
                            message
                        };
                        if let Some(entry) = settle_failure(txn, &mut task, message, now)? {
                            info!(
                                "Task {} failed, order {:?} refunded {}",
                                task.id, entry.order_ref, entry.delta
                            );
                        }
                        Ok(true)
                    }
                    TaskStatus::Pending | TaskStatus::Running => {
                        let progress = progress.max(task.progress);
                        if task.status == status && task.progress == progress && (message.is_empty() || task.message == message) {
                            return Ok(false);
                        }
                        task.status = status;
                        task.progress = progress;
                        if !message.is_empty() {
                            task.message = message.to_string();
                        }
                        task.updated_at = now;
                        txn.put(&task)?;
                        Ok(true)
                    }
                }
            })
            .await
    }

    /// Re-dispatch create tasks that never got a remote task id.
    async fn recover_undispatched(&self, now: DateTime<Utc>) -> NimbusResult<SweepReport> {
        let mut report = SweepReport::default();
        let cutoff = now - chrono_duration(self.dispatch_grace)?;

        let stranded = self
            .store
            .read("scan undispatched tasks", |txn| {
                txn.scan(|t: &Task| {
                    t.kind == TaskKind::CreateInstance
                        && t.status == TaskStatus::Pending
                        && t.external_task_id.is_empty()
                        && t.created_at <= cutoff
                })
            })
            .await?;

        for task in stranded {
            if self.saga.is_in_flight(task.id) {
                continue;
            }
            report.scanned += 1;
            info!("Re-dispatching create task {} for order {:?}", task.id, task.order_ref);
            match self.saga.provision(task.id).await {
                Ok(()) => report.changed += 1,
                Err(e) => {
                    warn!("Re-dispatch of task {} failed: {}", task.id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

fn activate_instance(txn: &crate::storage::DatabaseTransaction, instance_id: u64, now: DateTime<Utc>) -> NimbusResult<()> {
    let Some(mut instance) = txn.get::<Instance>(instance_id)? else {
        return Ok(());
    };
    if instance.status.is_administrative() || instance.status == InstanceStatus::Deleted {
        return Ok(());
    }
    if instance.status != InstanceStatus::Active {
        instance.status = InstanceStatus::Active;
        instance.updated_at = now;
        txn.put(&instance)?;
    }
    Ok(())
}

#[async_trait]
impl Reconciler for TaskReconciler {
    fn name(&self) -> &'static str {
        "task reconciler"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn sweep(&self) -> NimbusResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }
}
