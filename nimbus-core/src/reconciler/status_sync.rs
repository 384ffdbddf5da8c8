//! Copies remote instance status and ip onto local records

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Reconciler, SweepReport};
use crate::control_plane::ControlPlane;
use crate::error::NimbusResult;
use crate::instance_service::apply_report;
use crate::storage::Store;
use crate::types::{Instance, InstanceStatus};

pub struct StatusSyncReconciler {
    store: Store,
    control_plane: Arc<dyn ControlPlane>,
    interval: Duration,
    cancel: CancellationToken,
}

impl StatusSyncReconciler {
    pub fn new(
        store: Store,
        control_plane: Arc<dyn ControlPlane>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            control_plane,
            interval,
            cancel,
        }
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> NimbusResult<SweepReport> {
        let mut report = SweepReport::default();
        let instances = self
            .store
            .read("scan synced instances", |txn| {
                txn.scan(|i: &Instance| i.status != InstanceStatus::Deleted && !i.external_instance_id.is_empty())
            })
            .await?;

        for instance in instances {
            report.scanned += 1;
            let remote = match self
                .control_plane
                .get_instance_status(&instance.external_instance_id, &self.cancel)
                .await
            {
                Ok(remote) => remote,
                Err(e) => {
                    debug!("Status of instance {} unavailable: {}", instance.id, e);
                    report.failed += 1;
                    continue;
                }
            };

            let written = self
                .store
                .write("sync instance status", |txn| {
                    let mut current = txn.require::<Instance>(instance.id)?;
                    if current.status == InstanceStatus::Deleted || !apply_report(&mut current, &remote) {
                        return Ok(false);
                    }
                    current.updated_at = now;
                    txn.put(&current)?;
                    Ok(true)
                })
                .await;

            match written {
                Ok(true) => report.changed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Writing status of instance {} failed: {}", instance.id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl Reconciler for StatusSyncReconciler {
    fn name(&self) -> &'static str {
        "status sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn sweep(&self) -> NimbusResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }
}
