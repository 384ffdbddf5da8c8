//! HTTP implementation of the control plane capability
//!
//! Every call is a single signed JSON request. Transport failures and 5xx
//! responses are retried with exponential backoff and counted by a circuit
//! breaker that is consulted before each attempt; 4xx responses are returned
//! immediately as [`NimbusError::UpstreamClient`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nimbus_core::config::ControlPlaneConfig;
use nimbus_core::control_plane::{
    ConsoleInfo, ControlPlane, ControlPlaneFactory, CreateInstanceRequest, InstanceMetrics, InstanceReport,
    NodeReport, SnapshotInfo, TaskReport, TaskResult,
};
use nimbus_core::error::{NimbusError, NimbusResult};
use nimbus_core::patterns::circuit_breaker::{CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerState};
use nimbus_core::patterns::retry::{retry, RetryConfig};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::envelope::decode_payload;
use crate::signing::{RequestSigner, HEADER_API_KEY, HEADER_SIGNATURE, HEADER_TIMESTAMP};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_OPEN_DURATION: Duration = Duration::from_secs(30);

/// Client settings after defaults were applied to non-positive values.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl ClientSettings {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        let or_default = |value: Duration, default: Duration| if value.is_zero() { default } else { value };
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: or_default(config.timeout, DEFAULT_TIMEOUT),
            max_retries: config.max_retries,
            retry_backoff: or_default(config.retry_backoff, DEFAULT_RETRY_BACKOFF),
            failure_threshold: if config.circuit_failure_threshold == 0 {
                DEFAULT_FAILURE_THRESHOLD
            } else {
                config.circuit_failure_threshold
            },
            open_duration: or_default(config.circuit_open_duration, DEFAULT_OPEN_DURATION),
        }
    }
}

/// Build an escaped request path from raw segments.
pub fn escaped_path(segments: &[&str]) -> NimbusResult<String> {
    let mut url = url::Url::parse("http://control-plane/")
        .map_err(|e| NimbusError::internal(format!("path base: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| NimbusError::internal("path base cannot have segments"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.path().to_string())
}

pub struct HttpControlPlane {
    settings: ClientSettings,
    signer: RequestSigner,
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for HttpControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpControlPlane")
            .field("settings", &self.settings)
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl HttpControlPlane {
    pub fn new(config: &ControlPlaneConfig) -> NimbusResult<Self> {
        let settings = ClientSettings::from_config(config);
        if settings.base_url.is_empty() {
            return Err(NimbusError::configuration("control_plane", "base_url is required"));
        }

        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| NimbusError::configuration("control_plane", format!("http client: {}", e)))?;
        let breaker = CircuitBreakerBuilder::new("control-plane")
            .failure_threshold(settings.failure_threshold)
            .open_duration(settings.open_duration)
            .build();

        info!(
            "HTTP control plane at {} (timeout {:?}, {} retries)",
            settings.base_url, settings.timeout, settings.max_retries
        );
        Ok(Self {
            signer: RequestSigner::new(&config.api_key, &config.api_secret),
            settings,
            http,
            breaker,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.breaker.state()
    }

    async fn call<B, T>(
        &self,
        operation: &'static str,
        method: Method,
        path: String,
        body: Option<&B>,
        cancel: &CancellationToken,
    ) -> NimbusResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned + Default,
    {
        let payload = match body {
            Some(body) => serde_json::to_vec(body)?,
            None => b"{}".to_vec(),
        };
        let retry_config = RetryConfig::exponential(operation, self.settings.max_retries, self.settings.retry_backoff);
        let (path, payload) = (path.as_str(), payload.as_slice());

        let raw = retry(&retry_config, cancel, move |attempt| {
            let method = method.clone();
            async move {
                self.breaker.try_acquire()?;
                let result = self.send_once(operation, method, path, payload, attempt, cancel).await;
                if !matches!(result, Err(NimbusError::Cancelled { .. })) {
                    self.breaker.record(&result);
                }
                result
            }
        })
        .await?;

        decode_payload(operation, &raw)
    }

    async fn send_once(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        payload: &[u8],
        attempt: u32,
        cancel: &CancellationToken,
    ) -> NimbusResult<Vec<u8>> {
        let transport = |e: reqwest::Error| NimbusError::Transport {
            operation: operation.to_string(),
            attempts: attempt + 1,
            details: e.to_string(),
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
            .to_string();
        let signature = self.signer.sign(method.as_str(), path, &timestamp, payload)?;

        let request = self
            .http
            .request(method.clone(), format!("{}{}", self.settings.base_url, path))
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_API_KEY, self.signer.api_key())
            .header(HEADER_TIMESTAMP, &timestamp)
            .header(HEADER_SIGNATURE, signature)
            .body(payload.to_vec());

        debug!("{} {} (attempt {})", method, path, attempt + 1);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(NimbusError::Cancelled {
                    operation: operation.to_string(),
                })
            }
            response = request.send() => response.map_err(transport)?,
        };

        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;

        if status.is_server_error() {
            return Err(NimbusError::UpstreamServer {
                operation: operation.to_string(),
                status: status.as_u16(),
                attempts: attempt + 1,
            });
        }
        if status.is_client_error() {
            return Err(NimbusError::UpstreamClient {
                operation: operation.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    async fn get<T: DeserializeOwned + Default>(
        &self,
        operation: &'static str,
        segments: &[&str],
        cancel: &CancellationToken,
    ) -> NimbusResult<T> {
        self.call::<(), T>(operation, Method::GET, escaped_path(segments)?, None, cancel)
            .await
    }

    async fn post<T: DeserializeOwned + Default>(
        &self,
        operation: &'static str,
        segments: &[&str],
        cancel: &CancellationToken,
    ) -> NimbusResult<T> {
        self.call::<(), T>(operation, Method::POST, escaped_path(segments)?, None, cancel)
            .await
    }

    async fn delete<T: DeserializeOwned + Default>(
        &self,
        operation: &'static str,
        segments: &[&str],
        cancel: &CancellationToken,
    ) -> NimbusResult<T> {
        self.call::<(), T>(operation, Method::DELETE, escaped_path(segments)?, None, cancel)
            .await
    }
}

#[derive(Serialize)]
struct SnapshotName<'a> {
    name: &'a str,
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult> {
        self.call("create_instance", Method::POST, escaped_path(&["instances"])?, Some(request), cancel)
            .await
    }

    async fn start_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult> {
        self.post("start_instance", &["instances", instance_id, "start"], cancel)
            .await
    }

    async fn stop_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult> {
        self.post("stop_instance", &["instances", instance_id, "stop"], cancel)
            .await
    }

    async fn reboot_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult> {
        self.post("reboot_instance", &["instances", instance_id, "reboot"], cancel)
            .await
    }

    async fn delete_instance(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskResult> {
        self.delete("delete_instance", &["instances", instance_id], cancel)
            .await
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<InstanceReport> {
        self.get("get_instance_status", &["instances", instance_id, "status"], cancel)
            .await
    }

    async fn get_instance_metrics(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<InstanceMetrics> {
        self.get("get_instance_metrics", &["instances", instance_id, "metrics"], cancel)
            .await
    }

    async fn get_console_token(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<ConsoleInfo> {
        self.post("get_console_token", &["instances", instance_id, "console-token"], cancel)
            .await
    }

    async fn create_snapshot(
        &self,
        instance_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult> {
        let path = escaped_path(&["instances", instance_id, "snapshots"])?;
        self.call("create_snapshot", Method::POST, path, Some(&SnapshotName { name }), cancel)
            .await
    }

    async fn list_snapshots(&self, instance_id: &str, cancel: &CancellationToken) -> NimbusResult<Vec<SnapshotInfo>> {
        self.get("list_snapshots", &["instances", instance_id, "snapshots"], cancel)
            .await
    }

    async fn restore_snapshot(
        &self,
        instance_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult> {
        self.post(
            "restore_snapshot",
            &["instances", instance_id, "snapshots", name, "restore"],
            cancel,
        )
        .await
    }

    async fn delete_snapshot(
        &self,
        instance_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> NimbusResult<TaskResult> {
        self.delete("delete_snapshot", &["instances", instance_id, "snapshots", name], cancel)
            .await
    }

    async fn get_task_status(&self, task_id: &str, cancel: &CancellationToken) -> NimbusResult<TaskReport> {
        self.get("get_task_status", &["tasks", task_id], cancel).await
    }

    async fn get_node_status(&self, node: &str, cancel: &CancellationToken) -> NimbusResult<NodeReport> {
        self.get("get_node_status", &["nodes", node, "status"], cancel).await
    }
}

/// Registers the HTTP client as the `"http"` control plane backend.
pub struct HttpControlPlaneFactory;

impl ControlPlaneFactory for HttpControlPlaneFactory {
    fn create(&self, config: &ControlPlaneConfig) -> NimbusResult<Arc<dyn ControlPlane>> {
        Ok(Arc::new(HttpControlPlane::new(config)?))
    }

    fn backend_type(&self) -> &'static str {
        "http"
    }

    fn description(&self) -> &'static str {
        "Signed HTTP client for a remote virtualization control plane"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_for_zero_values() {
        let config = ControlPlaneConfig {
            base_url: "http://cp.local:9000/api/".to_string(),
            timeout: Duration::ZERO,
            max_retries: 0,
            retry_backoff: Duration::ZERO,
            circuit_failure_threshold: 0,
            circuit_open_duration: Duration::ZERO,
            ..ControlPlaneConfig::default()
        };
        let settings = ClientSettings::from_config(&config);

        assert_eq!(settings.base_url, "http://cp.local:9000/api");
        assert_eq!(settings.timeout, DEFAULT_TIMEOUT);
        assert_eq!(settings.retry_backoff, DEFAULT_RETRY_BACKOFF);
        assert_eq!(settings.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(settings.open_duration, DEFAULT_OPEN_DURATION);
    }

    #[test]
    fn test_escaped_path() {
        assert_eq!(escaped_path(&["instances"]).unwrap(), "/instances");
        assert_eq!(
            escaped_path(&["instances", "vm 1/a", "snapshots", "pre?x", "restore"]).unwrap(),
            "/instances/vm%201%2Fa/snapshots/pre%3Fx/restore"
        );
    }

    #[test]
    fn test_missing_base_url_is_rejected() {
        let config = ControlPlaneConfig {
            base_url: String::new(),
            ..ControlPlaneConfig::default()
        };
        assert!(HttpControlPlane::new(&config).is_err());
    }
}
