//! Configuration loaded from TOML with environment overrides
//!
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! changes. Durations use humantime notation (`"8s"`, `"1h"`); money is written
//! as decimal strings (`"1.00"`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{NimbusError, NimbusResult};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub control_plane: ControlPlaneConfig,
    pub reconcilers: ReconcilerConfig,
    pub billing: BillingConfig,
    pub provisioning: ProvisioningConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the redb database
    pub data_dir: PathBuf,
    /// Registered control plane backend, `"http"` or `"mock"`
    pub control_plane: String,
}

/// Connection and resilience settings for the external control plane.
///
/// Zero values are replaced by the client defaults when the client is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    pub circuit_failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub circuit_open_duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub task_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub task_interval: Duration,
    pub status_sync_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub status_sync_interval: Duration,
    pub billing_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub billing_interval: Duration,
    pub lifecycle_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub lifecycle_interval: Duration,
    /// How long a create task may sit undispatched before the task sweep retries it
    #[serde(with = "humantime_serde")]
    pub dispatch_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub hourly_rate: Decimal,
    pub min_recharge: Decimal,
    #[serde(with = "humantime_serde")]
    pub renewal_period: Duration,
    #[serde(with = "humantime_serde")]
    pub provision_period: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub bandwidth_mbps: u32,
    pub region_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `"pretty"` or `"json"`
    pub format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            control_plane: "http".to_string(),
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            timeout: Duration::from_secs(8),
            max_retries: 0,
            retry_backoff: Duration::from_millis(200),
            circuit_failure_threshold: 5,
            circuit_open_duration: Duration::from_secs(30),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            task_enabled: true,
            task_interval: Duration::from_secs(10),
            status_sync_enabled: true,
            status_sync_interval: Duration::from_secs(60),
            billing_enabled: true,
            billing_interval: Duration::from_secs(60 * 60),
            lifecycle_enabled: true,
            lifecycle_interval: DAY,
            dispatch_grace: Duration::from_secs(120),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            hourly_rate: Decimal::new(100, 2),
            min_recharge: Decimal::new(1000, 2),
            renewal_period: DAY * 30,
            provision_period: DAY * 30,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            bandwidth_mbps: 100,
            region_code: "default".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, apply env overrides and validate
    pub fn from_file<P: AsRef<Path>>(path: P) -> NimbusResult<Self> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::from_file`] but leaves validation to the caller, so that
    /// command line overrides can be applied first.
    pub fn load<P: AsRef<Path>>(path: P) -> NimbusResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            NimbusError::configuration("config", format!("failed to read {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> NimbusResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `NIMBUS_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("NIMBUS_DATA_DIR") {
            self.node.data_dir = PathBuf::from(dir);
        }
        if let Ok(backend) = std::env::var("NIMBUS_CONTROL_PLANE") {
            self.node.control_plane = backend;
        }
        if let Ok(url) = std::env::var("NIMBUS_CP_BASE_URL") {
            self.control_plane.base_url = url;
        }
        if let Ok(key) = std::env::var("NIMBUS_CP_API_KEY") {
            self.control_plane.api_key = key;
        }
        if let Ok(secret) = std::env::var("NIMBUS_CP_API_SECRET") {
            self.control_plane.api_secret = secret;
        }
        if let Ok(level) = std::env::var("NIMBUS_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> NimbusResult<()> {
        if self.node.data_dir.as_os_str().is_empty() {
            return Err(NimbusError::configuration("node", "data_dir cannot be empty"));
        }

        if self.node.control_plane == "http" && self.control_plane.base_url.trim().is_empty() {
            return Err(NimbusError::configuration(
                "control_plane",
                "base_url is required for the http backend",
            ));
        }

        let intervals = [
            ("task_interval", self.reconcilers.task_interval),
            ("status_sync_interval", self.reconcilers.status_sync_interval),
            ("billing_interval", self.reconcilers.billing_interval),
            ("lifecycle_interval", self.reconcilers.lifecycle_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(NimbusError::configuration(
                    "reconcilers",
                    format!("{} must be greater than zero", name),
                ));
            }
        }

        if self.billing.hourly_rate <= Decimal::ZERO {
            return Err(NimbusError::configuration("billing", "hourly_rate must be positive"));
        }
        if self.billing.min_recharge < Decimal::ZERO {
            return Err(NimbusError::configuration("billing", "min_recharge cannot be negative"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(NimbusError::configuration(
                    "logging",
                    format!("invalid log level: {}", other),
                ))
            }
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(NimbusError::configuration(
                    "logging",
                    format!("invalid log format: {}", other),
                ))
            }
        }

        Ok(())
    }
}

/// Configuration builder for programmatic construction
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.node.data_dir = dir.into();
        self
    }

    pub fn control_plane(mut self, backend: impl Into<String>) -> Self {
        self.config.node.control_plane = backend.into();
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.control_plane.base_url = url.into();
        self
    }

    pub fn credentials(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.control_plane.api_key = key.into();
        self.config.control_plane.api_secret = secret.into();
        self
    }

    pub fn hourly_rate(mut self, rate: Decimal) -> Self {
        self.config.billing.hourly_rate = rate;
        self
    }

    pub fn min_recharge(mut self, amount: Decimal) -> Self {
        self.config.billing.min_recharge = amount;
        self
    }

    pub fn dispatch_grace(mut self, grace: Duration) -> Self {
        self.config.reconcilers.dispatch_grace = grace;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> NimbusResult<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
