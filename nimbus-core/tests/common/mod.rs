// Shared fixtures for the nimbus-core scenario tests

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nimbus_core::catalog::{CatalogFile, ProductDefinition};
use nimbus_core::config::ConfigBuilder;
use nimbus_core::control_plane::{ControlPlane, MockControlPlane};
use nimbus_core::ledger::BalanceChange;
use nimbus_core::notification::{MemoryNotificationSink, NotificationSink};
use nimbus_core::order_saga::CreateOrderRequest;
use nimbus_core::services::NimbusServices;
use nimbus_core::storage::Store;
use nimbus_core::types::{Instance, Order, Product, ProductPrice, ProductStatus, Task};
use rust_decimal::Decimal;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const USER: u64 = 1;
pub const OTHER_USER: u64 = 2;

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// A node wired against the mock control plane and an in-memory notification sink.
pub struct Harness {
    pub dir: TempDir,
    pub services: NimbusServices,
    pub mock: Arc<MockControlPlane>,
    pub notifications: Arc<MemoryNotificationSink>,
    /// Published, priced at 30.00 per month.
    pub product: Product,
    /// Draft product, not orderable.
    pub draft: Product,
}

pub async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new()
        .data_dir(dir.path())
        .control_plane("mock")
        .hourly_rate(dec("1.00"))
        .build()
        .unwrap();

    let store = Store::open(dir.path()).unwrap();
    let mock = Arc::new(MockControlPlane::new());
    let notifications = Arc::new(MemoryNotificationSink::new());
    let services = NimbusServices::new(
        config,
        store,
        Arc::clone(&mock) as Arc<dyn ControlPlane>,
        Arc::clone(&notifications) as Arc<dyn NotificationSink>,
        CancellationToken::new(),
    );

    let file = CatalogFile {
        products: vec![
            ProductDefinition {
                name: "standard".to_string(),
                cpu: 2,
                memory_gb: 4,
                disk_gb: 40,
                os_options: vec!["ubuntu-22.04".to_string(), "debian-12".to_string()],
                status: ProductStatus::Published,
                prices: vec![ProductPrice {
                    billing_cycle: "month".to_string(),
                    unit_price: dec("30.00"),
                }],
                ..Default::default()
            },
            ProductDefinition {
                name: "retired".to_string(),
                status: ProductStatus::Draft,
                prices: vec![ProductPrice {
                    billing_cycle: "month".to_string(),
                    unit_price: dec("10.00"),
                }],
                ..Default::default()
            },
        ],
    };
    let mut products = services.catalog.import(&file).await.unwrap();
    let draft = products.pop().unwrap();
    let product = products.pop().unwrap();

    Harness {
        dir,
        services,
        mock,
        notifications,
        product,
        draft,
    }
}

impl Harness {
    pub async fn fund(&self, user_id: u64, amount: &str) {
        self.services
            .ledger
            .change_balance(BalanceChange::recharge(user_id, dec(amount), "test funding"))
            .await
            .unwrap();
    }

    pub async fn balance(&self, user_id: u64) -> Decimal {
        self.services.billing.wallet(user_id).await.unwrap().balance
    }

    pub fn monthly_order(&self, user_id: u64) -> CreateOrderRequest {
        CreateOrderRequest {
            user_id,
            product_id: self.product.id,
            billing_cycle: "month".to_string(),
            ..Default::default()
        }
    }

    /// Place an order and wait for its background dispatch to finish.
    pub async fn provisioned_order(&self, user_id: u64) -> (Order, Task) {
        let placed = self.services.saga.create_order(self.monthly_order(user_id)).await.unwrap();
        let (order_id, task_id) = (placed.order.id, placed.task.id);
        placed.dispatch.await.unwrap();

        let order = self.services.saga.order(user_id, order_id).await.unwrap();
        let task = self.services.saga.task(user_id, task_id).await.unwrap();
        (order, task)
    }

    pub async fn only_instance(&self, user_id: u64) -> Instance {
        let mut instances = self.services.instances.instances(user_id).await.unwrap();
        assert_eq!(instances.len(), 1, "expected exactly one instance");
        instances.remove(0)
    }

    pub async fn instance(&self, instance_id: u64) -> Instance {
        self.services
            .store
            .read("test load instance", |txn| txn.require::<Instance>(instance_id))
            .await
            .unwrap()
    }

    pub async fn set_expiry(&self, instance_id: u64, expire_at: DateTime<Utc>) {
        self.services
            .store
            .write("test set expiry", |txn| {
                let mut instance = txn.require::<Instance>(instance_id)?;
                instance.expire_at = Some(expire_at);
                txn.put(&instance)
            })
            .await
            .unwrap();
    }
}
