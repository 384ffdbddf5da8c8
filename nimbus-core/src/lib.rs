//! Nimbus core: wallet ledger, order saga, instance operations and the
//! reconciliation loops that keep local records consistent with a remote
//! virtualization control plane.

pub mod catalog;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod instance_service;
pub mod ledger;
pub mod notification;
pub mod order_saga;
pub mod patterns;
pub mod reconciler;
pub mod services;
pub mod storage;
pub mod types;

pub use catalog::{Catalog, CatalogFile};
pub use config::Config;
pub use control_plane::{ControlPlane, ControlPlaneFactory, ControlPlaneRegistry, MockControlPlane};
pub use error::{NimbusError, NimbusResult};
pub use instance_service::{InstanceAction, InstanceService};
pub use ledger::{BalanceChange, BillingService, Ledger};
pub use notification::{LogNotificationSink, MemoryNotificationSink, Notification, NotificationKind, NotificationSink};
pub use order_saga::{CreateOrderRequest, OrderSaga, PlacedOrder, Renewal};
pub use services::NimbusServices;
pub use storage::Store;
