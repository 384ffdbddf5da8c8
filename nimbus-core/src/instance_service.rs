//! User-initiated instance operations
//!
//! Every call checks that the instance belongs to the caller. Power actions
//! record a running [`Task`] carrying the remote task id so the task sweep
//! follows it to completion.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::control_plane::{ConsoleInfo, ControlPlane, InstanceMetrics, InstanceReport, TaskResult};
use crate::error::{NimbusError, NimbusResult};
use crate::storage::{DatabaseTransaction, Store};
use crate::types::{Instance, InstanceSnapshot, InstanceStatus, Task, TaskKind, TaskStatus, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Start,
    Stop,
    Reboot,
}

impl InstanceAction {
    fn transitional_status(self) -> InstanceStatus {
        match self {
            InstanceAction::Start => InstanceStatus::Starting,
            InstanceAction::Stop => InstanceStatus::Stopping,
            InstanceAction::Reboot => InstanceStatus::Rebooting,
        }
    }

    fn task_kind(self) -> TaskKind {
        match self {
            InstanceAction::Start => TaskKind::StartInstance,
            InstanceAction::Stop => TaskKind::StopInstance,
            InstanceAction::Reboot => TaskKind::RebootInstance,
        }
    }
}

impl FromStr for InstanceAction {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(InstanceAction::Start),
            "stop" => Ok(InstanceAction::Stop),
            "reboot" => Ok(InstanceAction::Reboot),
            other => Err(NimbusError::validation("action", format!("unsupported action '{}'", other))),
        }
    }
}

/// Copy a remote status report onto `instance`.
///
/// `suspended` and `expired` are decided locally and survive the report; the
/// ip is refreshed regardless. Only power states are taken from the remote,
/// so it can never suspend, expire or delete an instance. Unknown remote
/// statuses are ignored. Returns
/// whether anything changed.
pub(crate) fn apply_report(instance: &mut Instance, report: &InstanceReport) -> bool {
    let mut changed = false;

    if !instance.status.is_administrative() && !report.status.is_empty() {
        match report.status.parse::<InstanceStatus>() {
            Ok(status) if !status.is_remote_power_state() => debug!(
                "Ignoring remote status '{}' for instance {}, it is decided locally",
                report.status, instance.id
            ),
            Ok(status) if status != instance.status => {
                instance.status = status;
                changed = true;
            }
            Ok(_) => {}
            Err(_) => debug!(
                "Ignoring unknown remote status '{}' for instance {}",
                report.status, instance.id
            ),
        }
    }

    if !report.ip.is_empty() && report.ip != instance.ip {
        instance.ip = report.ip.clone();
        changed = true;
    }

    changed
}

pub struct InstanceService {
    store: Store,
    control_plane: Arc<dyn ControlPlane>,
    cancel: CancellationToken,
}

impl InstanceService {
    pub fn new(store: Store, control_plane: Arc<dyn ControlPlane>, cancel: CancellationToken) -> Self {
        Self {
            store,
            control_plane,
            cancel,
        }
    }

    pub async fn instances(&self, user_id: UserId) -> NimbusResult<Vec<Instance>> {
        self.store
            .read("list instances", |txn| txn.scan(|i: &Instance| i.user_id == user_id))
            .await
    }

    /// Load an owned instance, refreshing status and ip when the control plane answers.
    pub async fn instance(&self, user_id: UserId, instance_id: u64) -> NimbusResult<Instance> {
        let mut instance = self.owned(user_id, instance_id).await?;
        if instance.status == InstanceStatus::Deleted || instance.external_instance_id.is_empty() {
            return Ok(instance);
        }

        let external_id = instance.external_instance_id.clone();
        let report = match self.control_plane.get_instance_status(&external_id, &self.cancel).await {
            Ok(report) => report,
            Err(e) => {
                debug!("Status refresh of instance {} failed: {}", instance_id, e);
                return Ok(instance);
            }
        };

        if apply_report(&mut instance, &report) {
            instance.updated_at = Utc::now();
            let status = instance.status;
            let ip = instance.ip.clone();
            self.store
                .write("refresh instance", |txn| {
                    let mut current = txn.require::<Instance>(instance_id)?;
                    if current.status.is_administrative() || current.status == InstanceStatus::Deleted {
                        return Ok(());
                    }
                    current.status = status;
                    current.ip = ip;
                    current.updated_at = Utc::now();
                    txn.put(&current)
                })
                .await?;
        }
        Ok(instance)
    }

    /// Start, stop or reboot an instance and track the remote task.
    pub async fn operate(&self, user_id: UserId, instance_id: u64, action: InstanceAction) -> NimbusResult<Task> {
        let instance = self.owned(user_id, instance_id).await?;
        match instance.status {
            InstanceStatus::Deleted => {
                return Err(NimbusError::invalid_operation(
                    "operate",
                    format!("instance {} is deleted", instance_id),
                ))
            }
            status if status.is_administrative() => {
                return Err(NimbusError::invalid_operation(
                    action.task_kind().to_string(),
                    format!("instance {} is {}, renew or recharge first", instance_id, status),
                ))
            }
            _ => {}
        }
        let external_id = require_external_id(&instance)?;

        let result = match action {
            InstanceAction::Start => self.control_plane.start_instance(external_id, &self.cancel).await?,
            InstanceAction::Stop => self.control_plane.stop_instance(external_id, &self.cancel).await?,
            InstanceAction::Reboot => self.control_plane.reboot_instance(external_id, &self.cancel).await?,
        };

        let task = self
            .store
            .write("record instance operation", |txn| {
                let now = Utc::now();
                let mut instance = txn.require::<Instance>(instance_id)?;
                // Billing or expiry may have taken the instance over since the check above.
                if !instance.status.is_administrative() && instance.status != InstanceStatus::Deleted {
                    instance.status = action.transitional_status();
                    instance.updated_at = now;
                    txn.put(&instance)?;
                }

                let mut task = Task {
                    id: 0,
                    user_id,
                    order_ref: None,
                    instance_ref: Some(instance_id),
                    kind: action.task_kind(),
                    external_task_id: result.task_id.clone(),
                    external_instance_id: instance.external_instance_id.clone(),
                    status: TaskStatus::Running,
                    progress: 0,
                    message: result.description.clone(),
                    created_at: now,
                    updated_at: now,
                };
                txn.insert_new(&mut task)?;
                Ok(task)
            })
            .await?;

        info!("User {} requested {} of instance {} (task {})", user_id, task.kind, instance_id, task.id);
        Ok(task)
    }

    pub async fn console(&self, user_id: UserId, instance_id: u64) -> NimbusResult<ConsoleInfo> {
        let instance = self.owned(user_id, instance_id).await?;
        let external_id = require_external_id(&instance)?;
        self.control_plane.get_console_token(external_id, &self.cancel).await
    }

    pub async fn metrics(&self, user_id: UserId, instance_id: u64) -> NimbusResult<InstanceMetrics> {
        let instance = self.owned(user_id, instance_id).await?;
        let external_id = require_external_id(&instance)?;
        self.control_plane.get_instance_metrics(external_id, &self.cancel).await
    }

    pub async fn create_snapshot(
        &self,
        user_id: UserId,
        instance_id: u64,
        name: &str,
    ) -> NimbusResult<(TaskResult, InstanceSnapshot)> {
        if name.trim().is_empty() {
            return Err(NimbusError::validation("name", "snapshot name cannot be empty"));
        }
        let instance = self.owned(user_id, instance_id).await?;
        let external_id = require_external_id(&instance)?;
        let result = self.control_plane.create_snapshot(external_id, name, &self.cancel).await?;

        let snapshot = self
            .store
            .write("record snapshot", |txn| {
                let now = Utc::now();
                let mut snapshot = InstanceSnapshot {
                    id: 0,
                    instance_id,
                    name: name.to_string(),
                    status: "creating".to_string(),
                    created_at: now,
                    updated_at: now,
                };
                txn.insert_new(&mut snapshot)?;
                Ok(snapshot)
            })
            .await?;
        Ok((result, snapshot))
    }

    /// Locally recorded snapshots of an instance.
    pub async fn snapshots(&self, user_id: UserId, instance_id: u64) -> NimbusResult<Vec<InstanceSnapshot>> {
        self.owned(user_id, instance_id).await?;
        self.store
            .read("list snapshots", |txn| {
                txn.scan(|s: &InstanceSnapshot| s.instance_id == instance_id)
            })
            .await
    }

    pub async fn restore_snapshot(&self, user_id: UserId, instance_id: u64, name: &str) -> NimbusResult<TaskResult> {
        let instance = self.owned(user_id, instance_id).await?;
        let external_id = require_external_id(&instance)?;
        self.control_plane.restore_snapshot(external_id, name, &self.cancel).await
    }

    pub async fn delete_snapshot(&self, user_id: UserId, instance_id: u64, name: &str) -> NimbusResult<TaskResult> {
        let instance = self.owned(user_id, instance_id).await?;
        let external_id = require_external_id(&instance)?;
        let result = self.control_plane.delete_snapshot(external_id, name, &self.cancel).await?;

        self.store
            .write("remove snapshot records", |txn| {
                let doomed = txn.scan(|s: &InstanceSnapshot| s.instance_id == instance_id && s.name == name)?;
                for snapshot in doomed {
                    txn.remove::<InstanceSnapshot>(snapshot.id)?;
                }
                Ok(())
            })
            .await?;
        Ok(result)
    }

    async fn owned(&self, user_id: UserId, instance_id: u64) -> NimbusResult<Instance> {
        self.store
            .read("get instance", |txn| owned_instance(txn, user_id, instance_id))
            .await
    }
}

fn owned_instance(txn: &DatabaseTransaction, user_id: UserId, instance_id: u64) -> NimbusResult<Instance> {
    let instance = txn.require::<Instance>(instance_id)?;
    if instance.user_id != user_id {
        return Err(NimbusError::forbidden(format!(
            "instance {} belongs to another user",
            instance_id
        )));
    }
    Ok(instance)
}

fn require_external_id(instance: &Instance) -> NimbusResult<&str> {
    if instance.external_instance_id.is_empty() {
        return Err(NimbusError::invalid_operation(
            "control",
            format!("instance {} has no remote counterpart yet", instance.id),
        ));
    }
    Ok(&instance.external_instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(status: InstanceStatus) -> Instance {
        let now = Utc::now();
        Instance {
            id: 1,
            user_id: 1,
            order_ref: 1,
            external_instance_id: "mock-inst-1".to_string(),
            name: "vm-1".to_string(),
            ip: String::new(),
            status,
            cpu: 1,
            memory_gb: 1,
            disk_gb: 10,
            expire_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn report(status: &str, ip: &str) -> InstanceReport {
        InstanceReport {
            instance_id: "mock-inst-1".to_string(),
            status: status.to_string(),
            ip: ip.to_string(),
            node: "node-a".to_string(),
        }
    }

    #[test]
    fn test_apply_report_copies_status_and_ip() {
        let mut inst = instance(InstanceStatus::Active);
        assert!(apply_report(&mut inst, &report("running", "10.0.0.8")));
        assert_eq!(inst.status, InstanceStatus::Running);
        assert_eq!(inst.ip, "10.0.0.8");
        assert!(!apply_report(&mut inst, &report("running", "10.0.0.8")));
    }

    #[test]
    fn test_apply_report_keeps_administrative_status() {
        let mut inst = instance(InstanceStatus::Suspended);
        assert!(apply_report(&mut inst, &report("stopped", "10.0.0.9")));
        assert_eq!(inst.status, InstanceStatus::Suspended);
        assert_eq!(inst.ip, "10.0.0.9");
    }

    #[test]
    fn test_apply_report_skips_unknown_status() {
        let mut inst = instance(InstanceStatus::Running);
        assert!(!apply_report(&mut inst, &report("paused-ish", "")));
        assert_eq!(inst.status, InstanceStatus::Running);
    }

    #[test]
    fn test_apply_report_ignores_locally_owned_states() {
        for remote in ["suspended", "expired", "deleted", "active"] {
            let mut inst = instance(InstanceStatus::Running);
            assert!(!apply_report(&mut inst, &report(remote, "")), "{}", remote);
            assert_eq!(inst.status, InstanceStatus::Running);
            assert_eq!(inst.deleted_at, None);
        }

        let mut inst = instance(InstanceStatus::Running);
        assert!(apply_report(&mut inst, &report("deleted", "10.0.0.4")));
        assert_eq!(inst.status, InstanceStatus::Running);
        assert_eq!(inst.ip, "10.0.0.4");
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("reboot".parse::<InstanceAction>().unwrap(), InstanceAction::Reboot);
        assert!("explode".parse::<InstanceAction>().is_err());
    }
}
