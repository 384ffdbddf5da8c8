//! Order placement and provisioning saga
//!
//! Phase one runs in a single store transaction: resolve the product and spec,
//! freeze a [`ConfigSnapshot`], create the pending order and its
//! `create_instance` task, and debit the wallet. Nothing is written if any step
//! fails.
//!
//! Phase two runs detached: ask the control plane to create the instance and
//! settle the order as active or failed. A failed order is refunded in the same
//! transaction that moves it out of `pending`, so whichever of the saga and the
//! task reconciler settles first wins and the other becomes a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BillingConfig, ProvisioningConfig};
use crate::control_plane::{ControlPlane, CreateInstanceRequest, TaskResult};
use crate::error::{NimbusError, NimbusResult};
use crate::ledger::{BalanceChange, Ledger, MONEY_SCALE};
use crate::storage::{DatabaseTransaction, Store};
use crate::types::{
    ConfigSnapshot, Instance, InstanceStatus, LedgerEntry, Order, OrderStatus, Product, ProductStatus,
    Task, TaskKind, TaskStatus, UserId,
};

const PASSWORD_LENGTH: usize = 16;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOrderRequest {
    pub user_id: UserId,
    pub product_id: u64,
    pub billing_cycle: String,
    pub os: String,
    /// Zero means "use the product default".
    pub cpu: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
}

/// Result of phase one. `dispatch` completes when phase two has finished.
#[derive(Debug)]
pub struct PlacedOrder {
    pub order: Order,
    pub task: Task,
    pub dispatch: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Renewal {
    pub entry: LedgerEntry,
    pub instance: Option<Instance>,
}

pub struct OrderSaga {
    store: Store,
    control_plane: Arc<dyn ControlPlane>,
    billing: BillingConfig,
    provisioning: ProvisioningConfig,
    in_flight: DashSet<u64>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for OrderSaga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderSaga")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl OrderSaga {
    pub fn new(
        store: Store,
        control_plane: Arc<dyn ControlPlane>,
        billing: BillingConfig,
        provisioning: ProvisioningConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            control_plane,
            billing,
            provisioning,
            in_flight: DashSet::new(),
            shutdown,
        }
    }

    /// Place an order and dispatch provisioning in the background.
    pub async fn create_order(self: &Arc<Self>, request: CreateOrderRequest) -> NimbusResult<PlacedOrder> {
        let (order, task) = self.place_order(&request).await?;
        info!(
            "Order {} placed by user {} for product {} ({} {})",
            order.id, order.user_id, order.product_id, order.amount, order.billing_cycle
        );

        let saga = Arc::clone(self);
        let task_id = task.id;
        let dispatch = tokio::spawn(async move {
            if let Err(e) = saga.provision(task_id).await {
                error!("Provisioning of task {} failed: {}", task_id, e);
            }
        });

        Ok(PlacedOrder { order, task, dispatch })
    }

    /// Phase one: validate, debit and persist the pending order and task atomically.
    pub async fn place_order(&self, request: &CreateOrderRequest) -> NimbusResult<(Order, Task)> {
        let now = Utc::now();
        self.store
            .write("place order", |txn| {
                let product = txn
                    .get::<Product>(request.product_id)?
                    .ok_or_else(|| NimbusError::not_found(format!("product {}", request.product_id)))?;
                if product.status != ProductStatus::Published {
                    return Err(NimbusError::ProductUnavailable {
                        product_id: product.id,
                    });
                }

                let spec = resolve_spec(&product, request)?;
                let unit_price = product
                    .price_for(&request.billing_cycle)
                    .ok_or_else(|| NimbusError::InvalidBillingCycle {
                        product_id: product.id,
                        cycle: request.billing_cycle.clone(),
                    })?
                    .round_dp(MONEY_SCALE);

                let snapshot = ConfigSnapshot {
                    cpu: spec.cpu,
                    memory: spec.memory_gb,
                    disk: spec.disk_gb,
                    bandwidth: product.bandwidth_mbps,
                    os: spec.os,
                    unit_price,
                    billing_cycle: request.billing_cycle.clone(),
                    total_amount: unit_price,
                };

                let mut order = Order {
                    id: 0,
                    user_id: request.user_id,
                    product_id: product.id,
                    amount: unit_price,
                    billing_cycle: request.billing_cycle.clone(),
                    status: OrderStatus::Pending,
                    config_snapshot: serde_json::to_string(&snapshot)?,
                    created_at: now,
                    updated_at: now,
                };
                txn.insert_new(&mut order)?;

                Ledger::apply_in(
                    txn,
                    &BalanceChange::consume(request.user_id, unit_price, Some(order.id), "order debit"),
                    now,
                )?;

                let mut task = Task {
                    id: 0,
                    user_id: request.user_id,
                    order_ref: Some(order.id),
                    instance_ref: None,
                    kind: TaskKind::CreateInstance,
                    external_task_id: String::new(),
                    external_instance_id: String::new(),
                    status: TaskStatus::Pending,
                    progress: 0,
                    message: "order created, awaiting dispatch".to_string(),
                    created_at: now,
                    updated_at: now,
                };
                txn.insert_new(&mut task)?;

                Ok((order, task))
            })
            .await
    }

    /// Whether phase two of `task_id` is currently running in this process.
    pub fn is_in_flight(&self, task_id: u64) -> bool {
        self.in_flight.contains(&task_id)
    }

    /// Phase two for one `create_instance` task.
    ///
    /// Does nothing if the task was already dispatched or is being dispatched
    /// concurrently in this process.
    pub async fn provision(&self, task_id: u64) -> NimbusResult<()> {
        if !self.in_flight.insert(task_id) {
            debug!("Task {} is already being dispatched", task_id);
            return Ok(());
        }
        let result = self.dispatch(task_id).await;
        self.in_flight.remove(&task_id);
        result
    }

    async fn dispatch(&self, task_id: u64) -> NimbusResult<()> {
        let (task, order) = self
            .store
            .read("load task for dispatch", |txn| {
                let task = txn.require::<Task>(task_id)?;
                let order_id = task
                    .order_ref
                    .ok_or_else(|| NimbusError::internal(format!("task {} has no order", task_id)))?;
                let order = txn.require::<Order>(order_id)?;
                Ok((task, order))
            })
            .await?;

        if task.status != TaskStatus::Pending || !task.external_task_id.is_empty() {
            debug!("Task {} was already dispatched", task_id);
            return Ok(());
        }
        if order.status != OrderStatus::Pending {
            debug!("Order {} is already {}", order.id, order.status);
            return Ok(());
        }

        let snapshot: ConfigSnapshot = serde_json::from_str(&order.config_snapshot)?;
        let request = self.provision_request(&order, &snapshot);

        let created = match self.control_plane.create_instance(&request, &self.shutdown).await {
            Ok(created) => created,
            Err(NimbusError::Cancelled { .. }) => {
                warn!("Dispatch of task {} cancelled, leaving it for recovery", task_id);
                return Ok(());
            }
            Err(e) => {
                warn!("Control plane rejected order {}: {}", order.id, e);
                self.fail(task_id, format!("provisioning request failed: {}", e)).await?;
                return Ok(());
            }
        };

        self.mark_dispatched(task_id, &created).await?;

        match self.control_plane.get_task_status(&created.task_id, &self.shutdown).await {
            Ok(report) if report.status.parse::<TaskStatus>().ok() == Some(TaskStatus::Failed) => {
                let message = if report.message.is_empty() {
                    "control plane reported the create task failed".to_string()
                } else {
                    report.message
                };
                self.fail(task_id, message).await
            }
            Ok(_) => {
                let ip = self.lookup_ip(created.instance_id.as_deref()).await;
                let period = self.billing.provision_period;
                let instance = self
                    .store
                    .write("complete order", |txn| {
                        let mut task = txn.require::<Task>(task_id)?;
                        settle_success(txn, &mut task, &ip, period, Utc::now())
                    })
                    .await?;
                if let Some(instance) = instance {
                    info!("Order {} provisioned as instance {} ({})", order.id, instance.id, instance.name);
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Could not poll create task {} for order {}, the task sweep will settle it: {}",
                    created.task_id, order.id, e
                );
                Ok(())
            }
        }
    }

    fn provision_request(&self, order: &Order, snapshot: &ConfigSnapshot) -> CreateInstanceRequest {
        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LENGTH)
            .map(char::from)
            .collect();

        CreateInstanceRequest {
            name: format!("order-{}", order.id),
            cpu: snapshot.cpu,
            memory_mb: snapshot.memory.saturating_mul(1024),
            disk_gb: snapshot.disk,
            bandwidth_mbps: self.provisioning.bandwidth_mbps,
            template: snapshot.os.clone(),
            password,
            region_code: self.provisioning.region_code.clone(),
        }
    }

    async fn mark_dispatched(&self, task_id: u64, created: &TaskResult) -> NimbusResult<()> {
        self.store
            .write("mark task dispatched", |txn| {
                let mut task = txn.require::<Task>(task_id)?;
                if !task.status.can_advance_to(TaskStatus::Running) {
                    return Ok(());
                }
                task.status = TaskStatus::Running;
                task.external_task_id = created.task_id.clone();
                task.external_instance_id = created.instance_id.clone().unwrap_or_default();
                task.progress = task.progress.max(50);
                task.message = "instance creating".to_string();
                task.updated_at = Utc::now();
                txn.put(&task)
            })
            .await
    }

    async fn fail(&self, task_id: u64, message: String) -> NimbusResult<()> {
        let refunded = self
            .store
            .write("fail order", |txn| {
                let mut task = txn.require::<Task>(task_id)?;
                settle_failure(txn, &mut task, &message, Utc::now())
            })
            .await;

        match refunded {
            Ok(Some(entry)) => {
                info!(
                    "Order {:?} failed, refunded {} to user {}",
                    entry.order_ref, entry.delta, entry.user_id
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                error!("Compensation for task {} failed: {}", task_id, e);
                Err(e)
            }
        }
    }

    async fn lookup_ip(&self, external_instance_id: Option<&str>) -> String {
        let Some(id) = external_instance_id.filter(|id| !id.is_empty()) else {
            return String::new();
        };
        match self.control_plane.get_instance_status(id, &self.shutdown).await {
            Ok(report) => report.ip,
            Err(e) => {
                debug!("Could not read ip of {}: {}", id, e);
                String::new()
            }
        }
    }

    /// Renew an active order: debit and extend the linked instance in one transaction.
    pub async fn renew(&self, user_id: UserId, order_id: u64, amount: Option<Decimal>) -> NimbusResult<Renewal> {
        let period = chrono_duration(self.billing.renewal_period)?;
        let now = Utc::now();

        let renewal = self
            .store
            .write("renew order", |txn| {
                let order = owned_order(txn, user_id, order_id)?;
                if order.status != OrderStatus::Active {
                    return Err(NimbusError::invalid_operation(
                        "renew",
                        format!("order {} is {}, only active orders can be renewed", order.id, order.status),
                    ));
                }

                let amount = amount.unwrap_or(order.amount);
                if amount <= Decimal::ZERO {
                    return Err(NimbusError::validation("amount", "renewal amount must be positive"));
                }

                let entry = Ledger::apply_in(
                    txn,
                    &BalanceChange::consume(user_id, amount, Some(order.id), "order renewal"),
                    now,
                )?;

                let instance = txn
                    .scan(|i: &Instance| i.order_ref == order.id && i.status != InstanceStatus::Deleted)?
                    .into_iter()
                    .next();
                let instance = match instance {
                    Some(mut instance) => {
                        let base = instance.expire_at.unwrap_or(now);
                        let next = base + period;
                        instance.expire_at = Some(next);
                        if instance.status == InstanceStatus::Expired && next > now {
                            instance.status = InstanceStatus::Stopped;
                        }
                        instance.updated_at = now;
                        txn.put(&instance)?;
                        Some(instance)
                    }
                    None => None,
                };

                Ok(Renewal { entry, instance })
            })
            .await?;

        info!("Order {} renewed by user {} for {}", order_id, user_id, -renewal.entry.delta);
        Ok(renewal)
    }

    pub async fn order(&self, user_id: UserId, order_id: u64) -> NimbusResult<Order> {
        self.store
            .read("get order", |txn| owned_order(txn, user_id, order_id))
            .await
    }

    /// Orders of a user, newest first.
    pub async fn orders(&self, user_id: UserId, status: Option<OrderStatus>) -> NimbusResult<Vec<Order>> {
        let mut orders = self
            .store
            .read("list orders", |txn| {
                txn.scan(|o: &Order| o.user_id == user_id && status.map_or(true, |s| o.status == s))
            })
            .await?;
        orders.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(orders)
    }

    pub async fn task(&self, user_id: UserId, task_id: u64) -> NimbusResult<Task> {
        let task = self
            .store
            .read("get task", |txn| txn.require::<Task>(task_id))
            .await?;
        if task.user_id != user_id {
            return Err(NimbusError::forbidden(format!("task {} belongs to another user", task_id)));
        }
        Ok(task)
    }
}

fn owned_order(txn: &DatabaseTransaction, user_id: UserId, order_id: u64) -> NimbusResult<Order> {
    let order = txn.require::<Order>(order_id)?;
    if order.user_id != user_id {
        return Err(NimbusError::forbidden(format!("order {} belongs to another user", order_id)));
    }
    Ok(order)
}

pub(crate) fn chrono_duration(duration: Duration) -> NimbusResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| NimbusError::configuration("billing", format!("period out of range: {}", e)))
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedSpec {
    cpu: u32,
    memory_gb: u32,
    disk_gb: u32,
    os: String,
}

fn resolve_spec(product: &Product, request: &CreateOrderRequest) -> NimbusResult<ResolvedSpec> {
    let os = if request.os.is_empty() {
        product.os_options.first().cloned().unwrap_or_default()
    } else if product.os_options.is_empty() || product.os_options.contains(&request.os) {
        request.os.clone()
    } else {
        return Err(NimbusError::invalid_spec(
            "os",
            format!("'{}' is not offered for product {}", request.os, product.id),
        ));
    };

    if !product.customizable {
        return Ok(ResolvedSpec {
            cpu: product.cpu,
            memory_gb: product.memory_gb,
            disk_gb: product.disk_gb,
            os,
        });
    }

    let or_default = |value: u32, default: u32| if value == 0 { default } else { value };
    let cpu = or_default(request.cpu, product.cpu);
    let memory_gb = or_default(request.memory_gb, product.memory_gb);
    let disk_gb = or_default(request.disk_gb, product.disk_gb);

    check_range("cpu", cpu, product.min_cpu, product.max_cpu)?;
    check_range("memory", memory_gb, product.min_memory_gb, product.max_memory_gb)?;
    check_range("disk", disk_gb, product.min_disk_gb, product.max_disk_gb)?;

    Ok(ResolvedSpec {
        cpu,
        memory_gb,
        disk_gb,
        os,
    })
}

fn check_range(field: &str, value: u32, min: u32, max: u32) -> NimbusResult<()> {
    if min == 0 && max == 0 {
        if value == 0 {
            return Err(NimbusError::invalid_spec(field, "must be greater than zero"));
        }
        return Ok(());
    }
    if value < min || value > max {
        return Err(NimbusError::invalid_spec(
            field,
            format!("{} is outside the allowed range {}-{}", value, min, max),
        ));
    }
    Ok(())
}

/// Mark `task` succeeded and, for an order task, activate the order and make
/// sure its instance exists. Returns a newly created instance.
///
/// An order that already failed (and was refunded) is left alone.
pub(crate) fn settle_success(
    txn: &DatabaseTransaction,
    task: &mut Task,
    ip: &str,
    provision_period: Duration,
    now: DateTime<Utc>,
) -> NimbusResult<Option<Instance>> {
    if !task.status.can_advance_to(TaskStatus::Success) {
        return Ok(None);
    }
    task.status = TaskStatus::Success;
    task.progress = 100;
    task.updated_at = now;

    let mut created = None;
    if let Some(order_id) = task.order_ref {
        let mut order = txn.require::<Order>(order_id)?;
        match order.status {
            OrderStatus::Failed => {
                warn!(
                    "Create task {} succeeded remotely but order {} was already failed and refunded",
                    task.id, order_id
                );
                task.message = "instance created after the order was refunded".to_string();
            }
            OrderStatus::Pending | OrderStatus::Active => {
                if order.status == OrderStatus::Pending {
                    order.status = OrderStatus::Active;
                    order.updated_at = now;
                    txn.put(&order)?;
                }

                let existing = txn
                    .scan(|i: &Instance| i.order_ref == order_id)?
                    .into_iter()
                    .next();
                let instance_id = match existing {
                    Some(instance) => instance.id,
                    None => {
                        let snapshot: ConfigSnapshot = serde_json::from_str(&order.config_snapshot)?;
                        let mut instance = Instance {
                            id: 0,
                            user_id: order.user_id,
                            order_ref: order.id,
                            external_instance_id: task.external_instance_id.clone(),
                            name: format!("vm-{}", order.id),
                            ip: ip.to_string(),
                            status: InstanceStatus::Active,
                            cpu: snapshot.cpu,
                            memory_gb: snapshot.memory,
                            disk_gb: snapshot.disk,
                            expire_at: Some(now + chrono_duration(provision_period)?),
                            deleted_at: None,
                            created_at: now,
                            updated_at: now,
                        };
                        let id = txn.insert_new(&mut instance)?;
                        created = Some(instance);
                        id
                    }
                };
                task.instance_ref = Some(instance_id);
                task.message = "instance created".to_string();
            }
        }
    }

    txn.put(&*task)?;
    Ok(created)
}

/// Mark `task` failed and, if its order is still pending, fail the order and
/// refund it. Returns the refund entry when one was written.
pub(crate) fn settle_failure(
    txn: &DatabaseTransaction,
    task: &mut Task,
    message: &str,
    now: DateTime<Utc>,
) -> NimbusResult<Option<LedgerEntry>> {
    if !task.status.can_advance_to(TaskStatus::Failed) {
        return Ok(None);
    }
    task.status = TaskStatus::Failed;
    task.progress = 100;
    task.message = message.to_string();
    task.updated_at = now;
    txn.put(&*task)?;

    let Some(order_id) = task.order_ref else {
        return Ok(None);
    };
    let mut order = txn.require::<Order>(order_id)?;
    if order.status != OrderStatus::Pending {
        return Ok(None);
    }

    order.status = OrderStatus::Failed;
    order.updated_at = now;
    txn.put(&order)?;

    let entry = Ledger::apply_in(
        txn,
        &BalanceChange::refund(order.user_id, order.amount, Some(order.id), "provisioning failed refund"),
        now,
    )?;
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(customizable: bool) -> Product {
        let now = Utc::now();
        Product {
            id: 1,
            name: "standard".to_string(),
            description: String::new(),
            cpu: 2,
            memory_gb: 4,
            disk_gb: 40,
            bandwidth_mbps: 100,
            os_options: vec!["ubuntu-22.04".to_string(), "debian-12".to_string()],
            customizable,
            min_cpu: 1,
            max_cpu: 8,
            min_memory_gb: 0,
            max_memory_gb: 0,
            min_disk_gb: 20,
            max_disk_gb: 200,
            status: ProductStatus::Published,
            prices: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn request(cpu: u32, memory_gb: u32, disk_gb: u32) -> CreateOrderRequest {
        CreateOrderRequest {
            cpu,
            memory_gb,
            disk_gb,
            ..Default::default()
        }
    }

    #[test]
    fn test_fixed_product_ignores_requested_spec() {
        let spec = resolve_spec(&product(false), &request(64, 512, 9000)).unwrap();
        assert_eq!((spec.cpu, spec.memory_gb, spec.disk_gb), (2, 4, 40));
        assert_eq!(spec.os, "ubuntu-22.04");
    }

    #[test]
    fn test_customizable_product_fills_defaults_and_checks_ranges() {
        let spec = resolve_spec(&product(true), &request(4, 0, 0)).unwrap();
        assert_eq!((spec.cpu, spec.memory_gb, spec.disk_gb), (4, 4, 40));

        let spec = resolve_spec(&product(true), &request(0, 64, 0)).unwrap();
        assert_eq!(spec.memory_gb, 64);

        let err = resolve_spec(&product(true), &request(16, 0, 0)).unwrap_err();
        assert!(matches!(err, NimbusError::InvalidSpec { ref field, .. } if field == "cpu"));

        let err = resolve_spec(&product(true), &request(0, 0, 10)).unwrap_err();
        assert!(matches!(err, NimbusError::InvalidSpec { ref field, .. } if field == "disk"));
    }

    #[test]
    fn test_unknown_os_is_rejected() {
        let mut req = request(0, 0, 0);
        req.os = "templeos".to_string();
        assert!(resolve_spec(&product(false), &req).is_err());

        req.os = "debian-12".to_string();
        assert_eq!(resolve_spec(&product(false), &req).unwrap().os, "debian-12");
    }
}
