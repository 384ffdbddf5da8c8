//! Hourly metering of running and suspended instances
//!
//! A failed charge suspends a running instance; a successful charge of a
//! suspended instance resumes it. The remote stop or start is attempted first
//! and the local status only changes when it succeeded, so a failed remote
//! call is simply retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Reconciler, SweepReport};
use crate::control_plane::ControlPlane;
use crate::error::NimbusResult;
use crate::ledger::{BalanceChange, Ledger};
use crate::notification::{Notification, NotificationKind, NotificationSink};
use crate::storage::Store;
use crate::types::{Instance, InstanceStatus};

pub struct BillingReconciler {
    store: Store,
    ledger: Ledger,
    control_plane: Arc<dyn ControlPlane>,
    notifications: Arc<dyn NotificationSink>,
    hourly_rate: Decimal,
    interval: Duration,
    cancel: CancellationToken,
}

enum Outcome {
    Charged,
    Suspended,
    Resumed,
    Unchanged,
}

impl BillingReconciler {
    pub fn new(
        store: Store,
        ledger: Ledger,
        control_plane: Arc<dyn ControlPlane>,
        notifications: Arc<dyn NotificationSink>,
        hourly_rate: Decimal,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            ledger,
            control_plane,
            notifications,
            hourly_rate,
            interval,
            cancel,
        }
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> NimbusResult<SweepReport> {
        let mut report = SweepReport::default();
        let instances = self
            .store
            .read("scan billable instances", |txn| txn.scan(|i: &Instance| i.status.is_billable()))
            .await?;

        for instance in instances {
            report.scanned += 1;
            match self.bill(&instance, now).await {
                Ok(Outcome::Unchanged) => {}
                Ok(_) => report.changed += 1,
                Err(e) => {
                    warn!("Billing instance {} failed: {}", instance.id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn bill(&self, instance: &Instance, now: DateTime<Utc>) -> NimbusResult<Outcome> {
        let charge = BalanceChange::consume(
            instance.user_id,
            self.hourly_rate,
            Some(instance.order_ref),
            "hourly usage",
        );

        match self.ledger.change_balance(charge).await {
            Ok(_) if instance.status == InstanceStatus::Suspended => self.resume(instance, now).await,
            Ok(_) => {
                debug!("Charged {} for instance {}", self.hourly_rate, instance.id);
                Ok(Outcome::Charged)
            }
            Err(e) if e.is_insufficient_balance() => {
                if instance.status == InstanceStatus::Running {
                    self.suspend(instance, now).await
                } else {
                    Ok(Outcome::Unchanged)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn suspend(&self, instance: &Instance, now: DateTime<Utc>) -> NimbusResult<Outcome> {
        if !instance.external_instance_id.is_empty() {
            if let Err(e) = self
                .control_plane
                .stop_instance(&instance.external_instance_id, &self.cancel)
                .await
            {
                warn!(
                    "Stopping unpaid instance {} failed, retrying next tick: {}",
                    instance.id, e
                );
                return Ok(Outcome::Unchanged);
            }
        }

        let written = self
            .transition(instance.id, InstanceStatus::Running, InstanceStatus::Suspended, now)
            .await?;
        if !written {
            return Ok(Outcome::Unchanged);
        }

        info!("Instance {} suspended for insufficient balance", instance.id);
        self.notifications
            .notify(Notification {
                user_id: instance.user_id,
                instance_id: instance.id,
                kind: NotificationKind::Suspended,
                message: format!(
                    "Instance {} was suspended because the balance cannot cover {} per hour",
                    instance.name, self.hourly_rate
                ),
            })
            .await;
        Ok(Outcome::Suspended)
    }

    async fn resume(&self, instance: &Instance, now: DateTime<Utc>) -> NimbusResult<Outcome> {
        if !instance.external_instance_id.is_empty() {
            if let Err(e) = self
                .control_plane
                .start_instance(&instance.external_instance_id, &self.cancel)
                .await
            {
                warn!(
                    "Resuming instance {} failed, retrying next tick: {}",
                    instance.id, e
                );
                return Ok(Outcome::Charged);
            }
        }

        let written = self
            .transition(instance.id, InstanceStatus::Suspended, InstanceStatus::Running, now)
            .await?;
        if !written {
            return Ok(Outcome::Charged);
        }

        info!("Instance {} resumed", instance.id);
        self.notifications
            .notify(Notification {
                user_id: instance.user_id,
                instance_id: instance.id,
                kind: NotificationKind::Resumed,
                message: format!("Instance {} was resumed", instance.name),
            })
            .await;
        Ok(Outcome::Resumed)
    }

    /// Move an instance from `from` to `to`, unless something else changed it meanwhile.
    async fn transition(
        &self,
        instance_id: u64,
        from: InstanceStatus,
        to: InstanceStatus,
        now: DateTime<Utc>,
    ) -> NimbusResult<bool> {
        self.store
            .write("billing status transition", |txn| {
                let mut instance = txn.require::<Instance>(instance_id)?;
                if instance.status != from {
                    return Ok(false);
                }
                instance.status = to;
                instance.updated_at = now;
                txn.put(&instance)?;
                Ok(true)
            })
            .await
    }
}

#[async_trait]
impl Reconciler for BillingReconciler {
    fn name(&self) -> &'static str {
        "billing reconciler"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn sweep(&self) -> NimbusResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }
}
