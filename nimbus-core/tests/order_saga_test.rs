//! Order placement, provisioning and compensation

mod common;

use chrono::Utc;
use common::{dec, harness, OTHER_USER, USER};
use nimbus_core::error::NimbusError;
use nimbus_core::order_saga::CreateOrderRequest;
use nimbus_core::types::{ConfigSnapshot, InstanceStatus, LedgerKind, OrderStatus, TaskStatus};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_order_provisions_instance_and_debits_once() {
    let h = harness().await;
    h.fund(USER, "100").await;

    let (order, task) = h.provisioned_order(USER).await;

    assert_eq!(order.status, OrderStatus::Active);
    assert_eq!(order.amount, dec("30.00"));
    assert_eq!(h.balance(USER).await, dec("70.00"));

    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.progress, 100);
    assert!(!task.external_task_id.is_empty());

    let instance = h.only_instance(USER).await;
    assert_eq!(task.instance_ref, Some(instance.id));
    assert_eq!(instance.name, format!("vm-{}", order.id));
    assert_eq!(instance.status, InstanceStatus::Active);
    assert_eq!(instance.ip, "10.0.0.8");
    assert_eq!((instance.cpu, instance.memory_gb, instance.disk_gb), (2, 4, 40));
    assert!(instance.expire_at.unwrap() > Utc::now() + chrono::Duration::days(29));

    let entries = h.services.billing.entries(USER, None, None).await.unwrap();
    let consumes: Vec<_> = entries.iter().filter(|e| e.kind == LedgerKind::Consume).collect();
    assert_eq!(consumes.len(), 1);
    assert_eq!(consumes[0].delta, dec("-30.00"));
    assert_eq!(consumes[0].order_ref, Some(order.id));
    assert_eq!(consumes[0].remark, "order debit");
}

#[tokio::test]
async fn test_provision_request_uses_snapshot() {
    let h = harness().await;
    h.fund(USER, "100").await;

    let (order, _) = h.provisioned_order(USER).await;

    let snapshot: ConfigSnapshot = serde_json::from_str(&order.config_snapshot).unwrap();
    assert_eq!(snapshot.os, "ubuntu-22.04");
    assert_eq!(snapshot.total_amount, dec("30.00"));
    assert_eq!(snapshot.billing_cycle, "month");
    assert!(h
        .mock
        .calls()
        .contains(&format!("create_instance:order-{}", order.id)));
}

#[tokio::test]
async fn test_rejected_create_refunds_order() {
    let h = harness().await;
    h.fund(USER, "100").await;
    h.mock.fail_operation("create_instance");

    let (order, task) = h.provisioned_order(USER).await;

    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(h.balance(USER).await, dec("100"));
    assert!(h.services.instances.instances(USER).await.unwrap().is_empty());

    let kinds: Vec<_> = h
        .services
        .billing
        .entries(USER, None, None)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![LedgerKind::Refund, LedgerKind::Consume, LedgerKind::Recharge]);
}

#[tokio::test]
async fn test_failed_create_task_refunds_order() {
    let h = harness().await;
    h.fund(USER, "100").await;
    h.mock.fail_created_tasks();

    let (order, task) = h.provisioned_order(USER).await;

    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.message, "task failed on hypervisor");
    assert!(!task.external_task_id.is_empty());
    assert_eq!(h.balance(USER).await, dec("100"));
    assert!(h.services.instances.instances(USER).await.unwrap().is_empty());

    let entries = h.services.billing.entries(USER, None, None).await.unwrap();
    let deltas: Vec<_> = entries
        .iter()
        .filter(|e| e.order_ref == Some(order.id))
        .map(|e| (e.kind, e.delta))
        .collect();
    assert_eq!(
        deltas,
        vec![(LedgerKind::Refund, dec("30.00")), (LedgerKind::Consume, dec("-30.00"))]
    );

    // The task sweep sees a terminal task and refunds nothing more.
    h.services.task_reconciler().sweep_at(Utc::now()).await.unwrap();
    assert_eq!(h.balance(USER).await, dec("100"));
}

#[tokio::test]
async fn test_insufficient_balance_leaves_no_trace() {
    let h = harness().await;
    h.fund(USER, "10").await;

    let err = h
        .services
        .saga
        .create_order(h.monthly_order(USER))
        .await
        .unwrap_err();

    assert!(err.is_insufficient_balance());
    assert_eq!(h.balance(USER).await, dec("10"));
    assert!(h.services.saga.orders(USER, None).await.unwrap().is_empty());
    assert_eq!(h.mock.count_calls("create_instance"), 0);
}

#[tokio::test]
async fn test_order_validation_errors() {
    let h = harness().await;
    h.fund(USER, "100").await;
    let saga = &h.services.saga;

    let missing = CreateOrderRequest {
        product_id: 9_999,
        ..h.monthly_order(USER)
    };
    assert!(matches!(
        saga.place_order(&missing).await,
        Err(NimbusError::NotFound { .. })
    ));

    let draft = CreateOrderRequest {
        product_id: h.draft.id,
        ..h.monthly_order(USER)
    };
    assert!(matches!(
        saga.place_order(&draft).await,
        Err(NimbusError::ProductUnavailable { .. })
    ));

    let yearly = CreateOrderRequest {
        billing_cycle: "year".to_string(),
        ..h.monthly_order(USER)
    };
    assert!(matches!(
        saga.place_order(&yearly).await,
        Err(NimbusError::InvalidBillingCycle { .. })
    ));

    let bad_os = CreateOrderRequest {
        os: "windows".to_string(),
        ..h.monthly_order(USER)
    };
    assert!(matches!(
        saga.place_order(&bad_os).await,
        Err(NimbusError::InvalidSpec { .. })
    ));

    assert_eq!(h.balance(USER).await, dec("100"));
}

#[tokio::test]
async fn test_renew_extends_instance() {
    let h = harness().await;
    h.fund(USER, "100").await;
    let (order, _) = h.provisioned_order(USER).await;
    let before = h.only_instance(USER).await.expire_at.unwrap();

    let renewal = h.services.saga.renew(USER, order.id, None).await.unwrap();

    assert_eq!(renewal.entry.delta, dec("-30.00"));
    assert_eq!(renewal.entry.remark, "order renewal");
    assert_eq!(h.balance(USER).await, dec("40.00"));
    let instance = renewal.instance.unwrap();
    assert_eq!(instance.expire_at.unwrap(), before + chrono::Duration::days(30));
}

#[tokio::test]
async fn test_renew_revives_expired_instance() {
    let h = harness().await;
    h.fund(USER, "100").await;
    let (order, _) = h.provisioned_order(USER).await;
    let instance = h.only_instance(USER).await;

    h.set_expiry(instance.id, Utc::now() - chrono::Duration::hours(2)).await;
    h.services.lifecycle_reconciler().sweep_at(Utc::now()).await.unwrap();
    assert_eq!(h.instance(instance.id).await.status, InstanceStatus::Expired);

    let renewal = h.services.saga.renew(USER, order.id, Some(dec("30"))).await.unwrap();
    assert_eq!(renewal.instance.unwrap().status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn test_renew_rejections() {
    let h = harness().await;
    h.fund(USER, "100").await;
    let (active, _) = h.provisioned_order(USER).await;

    assert!(matches!(
        h.services.saga.renew(OTHER_USER, active.id, None).await,
        Err(NimbusError::Forbidden { .. })
    ));
    assert!(matches!(
        h.services.saga.renew(USER, 9_999, None).await,
        Err(NimbusError::NotFound { .. })
    ));

    h.mock.fail_operation("create_instance");
    let (failed, _) = h.provisioned_order(USER).await;
    assert!(matches!(
        h.services.saga.renew(USER, failed.id, None).await,
        Err(NimbusError::InvalidOperation { .. })
    ));
}

#[tokio::test]
async fn test_queries_check_ownership() {
    let h = harness().await;
    h.fund(USER, "100").await;
    let (order, task) = h.provisioned_order(USER).await;

    assert!(matches!(
        h.services.saga.task(OTHER_USER, task.id).await,
        Err(NimbusError::Forbidden { .. })
    ));
    assert!(h.services.saga.order(OTHER_USER, order.id).await.is_err());

    let active = h.services.saga.orders(USER, Some(OrderStatus::Active)).await.unwrap();
    assert_eq!(active.len(), 1);
    assert!(h.services.saga.orders(USER, Some(OrderStatus::Failed)).await.unwrap().is_empty());
}
