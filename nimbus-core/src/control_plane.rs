//! Capability interface to the external virtualization control plane
//!
//! The control plane is slow and asynchronous: most mutating calls return a
//! remote task id that is polled later through [`ControlPlane::get_task_status`].
//! Implementations register a [`ControlPlaneFactory`] in a
//! [`ControlPlaneRegistry`]; the built-in registry only knows the `"mock"`
//! backend, the HTTP client is registered by the binary.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ControlPlaneConfig;
use crate::error::{NimbusError, NimbusResult};

/// Parameters of a provisioning request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub cpu: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub bandwidth_mbps: u32,
    pub template: String,
    pub password: String,
    pub region_code: String,
}

/// Acknowledgement of an accepted asynchronous operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub pve_task_id: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub node: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetrics {
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub network_in_kb: f64,
    #[serde(default)]
    pub network_out_kb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub ticket: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
}

/// Remote view of an asynchronous task. `status` is the raw remote string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
}

/// Operations offered by the external control plane.
///
/// Every call takes a cancellation token; a cancelled call returns
/// [`NimbusError::Cancelled`]. Implementations must be safe to call
/// concurrently from the saga, the services and every reconciler.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult>;

    async fn start_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult>;

    async fn stop_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult>;

    async fn reboot_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult>;

    async fn delete_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult>;

    async fn get_instance_status(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<InstanceReport>;

    async fn get_instance_metrics(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<InstanceMetrics>;

    async fn get_console_token(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<ConsoleInfo>;

    async fn create_snapshot(
        &self,
        instance_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult>;

    async fn list_snapshots(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<Vec<SnapshotInfo>>;

    async fn restore_snapshot(
        &self,
        instance_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult>;

    async fn delete_snapshot(
        &self,
        instance_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult>;

    async fn get_task_status(&self, task_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskReport>;

    async fn get_node_status(&self, node: &str, cancel: &CancellationToken) -> NimbusResult<NodeReport>;
}

/// Creates a control plane client from configuration
pub trait ControlPlaneFactory: Send + Sync {
    fn create(&self, config: &ControlPlaneConfig) -> NimbusResult<Arc<dyn ControlPlane>>;

    fn backend_type(&self) -> &'static str;

    fn description(&self) -> &'static str;
}

/// Registry for control plane factories
#[derive(Clone)]
pub struct ControlPlaneRegistry {
    factories: HashMap<String, Arc<dyn ControlPlaneFactory>>,
}

impl ControlPlaneRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn ControlPlaneFactory>) {
        let backend_type = factory.backend_type().to_string();
        tracing::info!(
            "Registering control plane backend: {} ({})",
            backend_type,
            factory.description()
        );
        self.factories.insert(backend_type, factory);
    }

    pub fn create(&self, backend_type: &str, config: &ControlPlaneConfig) -> NimbusResult<Arc<dyn ControlPlane>> {
        let factory = self.factories.get(backend_type).ok_or_else(|| {
            NimbusError::configuration(
                "control_plane",
                format!(
                    "Unknown control plane backend: '{}'. Available backends: {:?}",
                    backend_type,
                    self.list_available_backends()
                ),
            )
        })?;
        factory.create(config)
    }

    pub fn list_available_backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ControlPlaneRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MockControlPlaneFactory));
        registry
    }
}

pub struct MockControlPlaneFactory;

impl ControlPlaneFactory for MockControlPlaneFactory {
    fn create(&self, _config: &ControlPlaneConfig) -> NimbusResult<Arc<dyn ControlPlane>> {
        Ok(Arc::new(MockControlPlane::new()))
    }

    fn backend_type(&self) -> &'static str {
        "mock"
    }

    fn description(&self) -> &'static str {
        "In-process control plane double (no instances are provisioned)"
    }
}

/// Stateful in-process control plane.
///
/// A task reports `running` on its first status query and `success` after
/// that, unless it was marked with [`MockControlPlane::fail_task`] or created
/// after [`MockControlPlane::fail_created_tasks`].
/// Individual operations can be made to fail with
/// [`MockControlPlane::fail_operation`].
#[derive(Debug)]
pub struct MockControlPlane {
    task_queries: DashMap<String, u32>,
    failed_tasks: DashSet<String>,
    fail_created_tasks: AtomicBool,
    failing_operations: Mutex<HashSet<String>>,
    instance_reports: DashMap<String, InstanceReport>,
    snapshots: DashMap<String, Vec<SnapshotInfo>>,
    calls: Mutex<Vec<String>>,
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self {
            task_queries: DashMap::new(),
            failed_tasks: DashSet::new(),
            fail_created_tasks: AtomicBool::new(false),
            failing_operations: Mutex::new(HashSet::new()),
            instance_reports: DashMap::new(),
            snapshots: DashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make every future call of `operation` fail with a transport error.
    pub fn fail_operation(&self, operation: &str) {
        self.failing_operations.lock().insert(operation.to_string());
    }

    pub fn heal_operation(&self, operation: &str) {
        self.failing_operations.lock().remove(operation);
    }

    /// Make `task_id` report `failed` from now on.
    pub fn fail_task(&self, task_id: &str) {
        self.failed_tasks.insert(task_id.to_string());
    }

    /// Make every task created by a later `create_instance` report `failed`.
    pub fn fail_created_tasks(&self) {
        self.fail_created_tasks.store(true, Ordering::SeqCst);
    }

    /// Override what `get_instance_status` reports for `instance_id`.
    pub fn set_instance_report(&self, instance_id: &str, status: &str, ip: &str) {
        self.instance_reports.insert(
            instance_id.to_string(),
            InstanceReport {
                instance_id: instance_id.to_string(),
                status: status.to_string(),
                ip: ip.to_string(),
                node: "node-a".to_string(),
            },
        );
    }

    /// Every call made so far, as `operation:argument`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.calls.lock().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    fn enter(&self, operation: &str, argument: &str, cancel: &CancellationToken) -> NimbusResult<()> {
        if cancel.is_cancelled() {
            return Err(NimbusError::Cancelled {
                operation: operation.to_string(),
            });
        }
        self.calls.lock().push(format!("{}:{}", operation, argument));
        if self.failing_operations.lock().contains(operation) {
            return Err(NimbusError::Transport {
                operation: operation.to_string(),
                attempts: 1,
                details: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn new_task(description: impl Into<String>) -> TaskResult {
        let task_id = format!("mock-task-{}", Uuid::new_v4());
        TaskResult {
            pve_task_id: task_id.clone(),
            task_id,
            instance_id: None,
            description: description.into(),
        }
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult> {
        self.enter("create_instance", &request.name, cancel)?;
        let mut result = Self::new_task(format!("create {}", request.name));
        result.instance_id = Some(format!("mock-inst-{}", Uuid::new_v4()));
        if self.fail_created_tasks.load(Ordering::SeqCst) {
            self.failed_tasks.insert(result.task_id.clone());
        }
        Ok(result)
    }

    async fn start_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult> {
        self.enter("start_instance", instance_id, cancel)?;
        Ok(Self::new_task(format!("start {}", instance_id)))
    }

    async fn stop_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult> {
        self.enter("stop_instance", instance_id, cancel)?;
        Ok(Self::new_task(format!("stop {}", instance_id)))
    }

    async fn reboot_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult> {
        self.enter("reboot_instance", instance_id, cancel)?;
        Ok(Self::new_task(format!("reboot {}", instance_id)))
    }

    async fn delete_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult> {
        self.enter("delete_instance", instance_id, cancel)?;
        self.instance_reports.remove(instance_id);
        Ok(Self::new_task(format!("delete {}", instance_id)))
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<InstanceReport> {
        self.enter("get_instance_status", instance_id, cancel)?;
        if let Some(report) = self.instance_reports.get(instance_id) {
            return Ok(report.clone());
        }
        Ok(InstanceReport {
            instance_id: instance_id.to_string(),
            status: "running".to_string(),
            ip: "10.0.0.8".to_string(),
            node: "node-a".to_string(),
        })
    }

    async fn get_instance_metrics(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<InstanceMetrics> {
        self.enter("get_instance_metrics", instance_id, cancel)?;
        Ok(InstanceMetrics {
            cpu_usage: 12.5,
            memory_usage: 40.0,
            disk_usage: 21.0,
            network_in_kb: 128.0,
            network_out_kb: 64.0,
        })
    }

    async fn get_console_token(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<ConsoleInfo> {
        self.enter("get_console_token", instance_id, cancel)?;
        Ok(ConsoleInfo {
            url: format!("https://console.mock/{}", instance_id),
            ticket: Uuid::new_v4().to_string(),
        })
    }

    async fn create_snapshot(
        &self,
        instance_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult> {
        self.enter("create_snapshot", instance_id, cancel)?;
        self.snapshots
            .entry(instance_id.to_string())
            .or_default()
            .push(SnapshotInfo {
                name: name.to_string(),
                status: "ready".to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
            });
        Ok(Self::new_task(format!("snapshot {} of {}", name, instance_id)))
    }

    async fn list_snapshots(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<Vec<SnapshotInfo>> {
        self.enter("list_snapshots", instance_id, cancel)?;
        Ok(self
            .snapshots
            .get(instance_id)
            .map(|s| s.value().clone())
            .unwrap_or_default())
    }

    async fn restore_snapshot(
        &self,
        instance_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult> {
        self.enter("restore_snapshot", instance_id, cancel)?;
        Ok(Self::new_task(format!("restore {} on {}", name, instance_id)))
    }

    async fn delete_snapshot(
        &self,
        instance_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult> {
        self.enter("delete_snapshot", instance_id, cancel)?;
        if let Some(mut snapshots) = self.snapshots.get_mut(instance_id) {
            snapshots.retain(|s| s.name != name);
        }
        Ok(Self::new_task(format!("delete snapshot {} of {}", name, instance_id)))
    }

    async fn get_task_status(&self, task_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskReport> {
        self.enter("get_task_status", task_id, cancel)?;

        if self.failed_tasks.contains(task_id) {
            return Ok(TaskReport {
                task_id: task_id.to_string(),
                status: "failed".to_string(),
                progress: 100,
                message: "task failed on hypervisor".to_string(),
            });
        }

        let queries = {
            let mut entry = self.task_queries.entry(task_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let (status, progress) = if queries == 1 { ("running", 50) } else { ("success", 100) };
        Ok(TaskReport {
            task_id: task_id.to_string(),
            status: status.to_string(),
            progress,
            message: String::new(),
        })
    }

    async fn get_node_status(&self, node: &str, cancel: &CancellationToken) -> NimbusResult<NodeReport> {
        self.enter("get_node_status", node, cancel)?;
        Ok(NodeReport {
            node: node.to_string(),
            cpu_usage: 20.0,
            memory_usage: 35.0,
            disk_usage: 50.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let mut registry = ControlPlaneRegistry::new();
        assert!(registry.list_available_backends().is_empty());

        registry.register(Arc::new(MockControlPlaneFactory));
        assert_eq!(registry.list_available_backends(), vec!["mock"]);

        let default_registry = ControlPlaneRegistry::default();
        assert!(default_registry.create("mock", &ControlPlaneConfig::default()).is_ok());

        let err = default_registry
            .create("carrier-pigeon", &ControlPlaneConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[tokio::test]
    async fn test_mock_task_progression() {
        let mock = MockControlPlane::new();
        let cancel = CancellationToken::new();

        let created = mock
            .create_instance(&CreateInstanceRequest::default(), &cancel)
            .await
            .unwrap();
        assert!(created.task_id.starts_with("mock-task-"));
        assert!(created.instance_id.unwrap().starts_with("mock-inst-"));

        let first = mock.get_task_status(&created.task_id, &cancel).await.unwrap();
        assert_eq!((first.status.as_str(), first.progress), ("running", 50));
        let second = mock.get_task_status(&created.task_id, &cancel).await.unwrap();
        assert_eq!((second.status.as_str(), second.progress), ("success", 100));

        mock.fail_task(&created.task_id);
        let third = mock.get_task_status(&created.task_id, &cancel).await.unwrap();
        assert_eq!(third.status, "failed");
    }

    #[tokio::test]
    async fn test_mock_failure_injection_and_call_log() {
        let mock = MockControlPlane::new();
        let cancel = CancellationToken::new();

        mock.fail_operation("stop_instance");
        assert!(mock.stop_instance("i-1", &cancel).await.is_err());
        assert!(mock.start_instance("i-1", &cancel).await.is_ok());

        mock.heal_operation("stop_instance");
        assert!(mock.stop_instance("i-1", &cancel).await.is_ok());

        assert_eq!(mock.count_calls("stop_instance"), 2);
        assert_eq!(mock.calls()[1], "start_instance:i-1");

        cancel.cancel();
        assert!(matches!(
            mock.start_instance("i-1", &cancel).await,
            Err(NimbusError::Cancelled { .. })
        ));
    }
}
