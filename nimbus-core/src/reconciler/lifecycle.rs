//! Expiry handling
//!
//! With `d = expire_at - now`:
//!
//! | range            | action                             |
//! |------------------|------------------------------------|
//! | `24h < d <= 72h` | notify "3 days left"               |
//! | `0 < d <= 24h`   | notify "1 day left"                |
//! | `-72h < d <= 0`  | stop, status `expired`             |
//! | `d <= -72h`      | delete, status `deleted`           |
//!
//! No record of sent notifications is kept; an instance whose window was
//! missed simply proceeds to the next applicable threshold.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Reconciler, SweepReport};
use crate::control_plane::ControlPlane;
use crate::error::NimbusResult;
use crate::notification::{Notification, NotificationKind, NotificationSink};
use crate::storage::Store;
use crate::types::{Instance, InstanceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStage {
    Healthy,
    ThreeDaysLeft,
    OneDayLeft,
    Expired,
    Overdue,
}

/// Which threshold `expire_at` falls into at `now`.
pub fn expiry_stage(expire_at: DateTime<Utc>, now: DateTime<Utc>) -> ExpiryStage {
    let day = chrono::Duration::hours(24);
    let three_days = chrono::Duration::hours(72);
    let d = expire_at - now;

    if d > three_days {
        ExpiryStage::Healthy
    } else if d > day {
        ExpiryStage::ThreeDaysLeft
    } else if d > chrono::Duration::zero() {
        ExpiryStage::OneDayLeft
    } else if d > -three_days {
        ExpiryStage::Expired
    } else {
        ExpiryStage::Overdue
    }
}

pub struct LifecycleReconciler {
    store: Store,
    control_plane: Arc<dyn ControlPlane>,
    notifications: Arc<dyn NotificationSink>,
    interval: Duration,
    cancel: CancellationToken,
}

impl LifecycleReconciler {
    pub fn new(
        store: Store,
        control_plane: Arc<dyn ControlPlane>,
        notifications: Arc<dyn NotificationSink>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            control_plane,
            notifications,
            interval,
            cancel,
        }
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> NimbusResult<SweepReport> {
        let mut report = SweepReport::default();
        let instances = self
            .store
            .read("scan expiring instances", |txn| {
                txn.scan(|i: &Instance| i.expire_at.is_some() && i.status != InstanceStatus::Deleted)
            })
            .await?;

        for instance in instances {
            let Some(expire_at) = instance.expire_at else {
                continue;
            };
            report.scanned += 1;

            let result = match expiry_stage(expire_at, now) {
                ExpiryStage::Healthy => Ok(false),
                ExpiryStage::ThreeDaysLeft => {
                    self.notify(&instance, NotificationKind::ExpiresInThreeDays, "expires in 3 days")
                        .await;
                    Ok(true)
                }
                ExpiryStage::OneDayLeft => {
                    self.notify(&instance, NotificationKind::ExpiresInOneDay, "expires in 1 day")
                        .await;
                    Ok(true)
                }
                ExpiryStage::Expired => self.expire(&instance, now).await,
                ExpiryStage::Overdue => self.delete(&instance, now).await,
            };

            match result {
                Ok(true) => report.changed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Lifecycle step for instance {} failed: {}", instance.id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn expire(&self, instance: &Instance, now: DateTime<Utc>) -> NimbusResult<bool> {
        if instance.status == InstanceStatus::Expired {
            return Ok(false);
        }
        if !instance.external_instance_id.is_empty() {
            if let Err(e) = self
                .control_plane
                .stop_instance(&instance.external_instance_id, &self.cancel)
                .await
            {
                warn!("Stopping expired instance {} failed, retrying next sweep: {}", instance.id, e);
                return Ok(false);
            }
        }

        self.store
            .write("expire instance", |txn| {
                let mut current = txn.require::<Instance>(instance.id)?;
                if current.status == InstanceStatus::Deleted {
                    return Ok(());
                }
                current.status = InstanceStatus::Expired;
                current.updated_at = now;
                txn.put(&current)
            })
            .await?;

        info!("Instance {} expired and stopped", instance.id);
        self.notify(instance, NotificationKind::Expired, "has expired and was stopped")
            .await;
        Ok(true)
    }

    async fn delete(&self, instance: &Instance, now: DateTime<Utc>) -> NimbusResult<bool> {
        if !instance.external_instance_id.is_empty() {
            if let Err(e) = self
                .control_plane
                .delete_instance(&instance.external_instance_id, &self.cancel)
                .await
            {
                warn!("Deleting overdue instance {} failed, retrying next sweep: {}", instance.id, e);
                return Ok(false);
            }
        }

        self.store
            .write("delete instance", |txn| {
                let mut current = txn.require::<Instance>(instance.id)?;
                current.status = InstanceStatus::Deleted;
                current.deleted_at = Some(now);
                current.updated_at = now;
                txn.put(&current)
            })
            .await?;

        info!("Instance {} deleted after expiry", instance.id);
        self.notify(instance, NotificationKind::Deleted, "was deleted after expiry")
            .await;
        Ok(true)
    }

    async fn notify(&self, instance: &Instance, kind: NotificationKind, what: &str) {
        self.notifications
            .notify(Notification {
                user_id: instance.user_id,
                instance_id: instance.id,
                kind,
                message: format!("Instance {} {}", instance.name, what),
            })
            .await;
    }
}

#[async_trait]
impl Reconciler for LifecycleReconciler {
    fn name(&self) -> &'static str {
        "lifecycle reconciler"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn sweep(&self) -> NimbusResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }
}
