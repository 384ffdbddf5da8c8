//! Domain records persisted by the store
//!
//! Every record here is bincode-encoded into a redb table, so the structs stay
//! plain: no flattening, no skipped fields, and JSON payloads are kept as text.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::NimbusError;

pub type UserId = u64;

/// Kind of a ledger mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Recharge,
    Consume,
    Refund,
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerKind::Recharge => write!(f, "recharge"),
            LedgerKind::Consume => write!(f, "consume"),
            LedgerKind::Refund => write!(f, "refund"),
        }
    }
}

/// A user's balance. Only the ledger mutates `balance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance: Decimal,
    pub frozen_balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn empty(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance: Decimal::ZERO,
            frozen_balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only record of one accepted balance change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub user_id: UserId,
    pub delta: Decimal,
    pub kind: LedgerKind,
    pub order_ref: Option<u64>,
    pub remark: String,
    pub balance_after: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Draft,
    Published,
    Offline,
}

/// Unit price of a product for one billing cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPrice {
    pub billing_cycle: String,
    pub unit_price: Decimal,
}

/// Catalog entry. Only `Published` products can be ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub cpu: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub bandwidth_mbps: u32,
    pub os_options: Vec<String>,
    pub customizable: bool,
    pub min_cpu: u32,
    pub max_cpu: u32,
    pub min_memory_gb: u32,
    pub max_memory_gb: u32,
    pub min_disk_gb: u32,
    pub max_disk_gb: u32,
    pub status: ProductStatus,
    pub prices: Vec<ProductPrice>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn price_for(&self, billing_cycle: &str) -> Option<Decimal> {
        self.prices
            .iter()
            .find(|p| p.billing_cycle == billing_cycle)
            .map(|p| p.unit_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Active,
    Failed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Active => write!(f, "active"),
            OrderStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub user_id: UserId,
    pub product_id: u64,
    pub amount: Decimal,
    pub billing_cycle: String,
    pub status: OrderStatus,
    /// JSON text of [`ConfigSnapshot`], frozen at creation.
    pub config_snapshot: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Resolved spec and price captured when an order is placed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub cpu: u32,
    pub memory: u32,
    pub disk: u32,
    pub bandwidth: u32,
    pub os: String,
    pub unit_price: Decimal,
    pub billing_cycle: String,
    pub total_amount: Decimal,
}

/// Status of a tracked asynchronous operation.
///
/// Ordering is `Pending < Running < {Success, Failed}`; the two terminal
/// states share a rank and neither can follow the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Success | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` keeps the status sequence monotonic.
    /// Re-observing the current status is allowed.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" | "ok" | "done" => Ok(TaskStatus::Success),
            "failed" | "error" => Ok(TaskStatus::Failed),
            other => Err(NimbusError::validation(
                "task_status",
                format!("unknown task status '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CreateInstance,
    StartInstance,
    StopInstance,
    RebootInstance,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::CreateInstance => write!(f, "create_instance"),
            TaskKind::StartInstance => write!(f, "start_instance"),
            TaskKind::StopInstance => write!(f, "stop_instance"),
            TaskKind::RebootInstance => write!(f, "reboot_instance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub user_id: UserId,
    pub order_ref: Option<u64>,
    pub instance_ref: Option<u64>,
    pub kind: TaskKind,
    /// Empty until the control plane accepted the operation.
    pub external_task_id: String,
    /// Remote instance id reported when a create operation was accepted.
    pub external_instance_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Active,
    Running,
    Starting,
    Stopping,
    Rebooting,
    Stopped,
    Suspended,
    Expired,
    Deleted,
}

impl InstanceStatus {
    /// States the hourly billing sweep charges for.
    pub fn is_billable(self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Suspended)
    }

    /// States set by local policy that a remote status report must not overwrite.
    pub fn is_administrative(self) -> bool {
        matches!(self, InstanceStatus::Suspended | InstanceStatus::Expired)
    }

    /// Power states the control plane is allowed to report.
    pub fn is_remote_power_state(self) -> bool {
        matches!(
            self,
            InstanceStatus::Pending
                | InstanceStatus::Running
                | InstanceStatus::Starting
                | InstanceStatus::Stopping
                | InstanceStatus::Rebooting
                | InstanceStatus::Stopped
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Active => "active",
            InstanceStatus::Running => "running",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Rebooting => "rebooting",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Expired => "expired",
            InstanceStatus::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for InstanceStatus {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(InstanceStatus::Pending),
            "active" => Ok(InstanceStatus::Active),
            "running" => Ok(InstanceStatus::Running),
            "starting" => Ok(InstanceStatus::Starting),
            "stopping" => Ok(InstanceStatus::Stopping),
            "rebooting" => Ok(InstanceStatus::Rebooting),
            "stopped" => Ok(InstanceStatus::Stopped),
            "suspended" => Ok(InstanceStatus::Suspended),
            "expired" => Ok(InstanceStatus::Expired),
            "deleted" => Ok(InstanceStatus::Deleted),
            other => Err(NimbusError::validation(
                "instance_status",
                format!("unknown instance status '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    pub user_id: UserId,
    pub order_ref: u64,
    pub external_instance_id: String,
    pub name: String,
    pub ip: String,
    pub status: InstanceStatus,
    pub cpu: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub expire_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Local record of a snapshot requested through the instance service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: u64,
    pub instance_id: u64,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_is_monotonic() {
        use TaskStatus::*;

        assert!(Pending.can_advance_to(Running));
        assert!(Pending.can_advance_to(Success));
        assert!(Running.can_advance_to(Failed));
        assert!(Running.can_advance_to(Running));
        assert!(Success.can_advance_to(Success));

        assert!(!Running.can_advance_to(Pending));
        assert!(!Success.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Success));
        assert!(!Failed.can_advance_to(Running));
    }

    #[test]
    fn test_remote_status_parsing() {
        assert_eq!("RUNNING".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert_eq!(" success ".parse::<TaskStatus>().unwrap(), TaskStatus::Success);
        assert!("exploded".parse::<TaskStatus>().is_err());

        assert_eq!("stopped".parse::<InstanceStatus>().unwrap(), InstanceStatus::Stopped);
        assert!("melted".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_instance_status_classes() {
        assert!(InstanceStatus::Running.is_billable());
        assert!(InstanceStatus::Suspended.is_billable());
        assert!(!InstanceStatus::Active.is_billable());
        assert!(InstanceStatus::Expired.is_administrative());
        assert!(!InstanceStatus::Running.is_administrative());
    }
}
