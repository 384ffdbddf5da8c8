//! User-initiated instance operations

mod common;

use chrono::Utc;
use common::{harness, OTHER_USER, USER};
use nimbus_core::error::NimbusError;
use nimbus_core::instance_service::InstanceAction;
use nimbus_core::types::{InstanceStatus, TaskKind, TaskStatus};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_stop_is_tracked_until_remote_task_completes() {
    let h = harness().await;
    h.fund(USER, "100").await;
    h.provisioned_order(USER).await;
    let instance = h.only_instance(USER).await;

    let task = h
        .services
        .instances
        .operate(USER, instance.id, InstanceAction::Stop)
        .await
        .unwrap();

    assert_eq!(task.kind, TaskKind::StopInstance);
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.instance_ref, Some(instance.id));
    assert_eq!(task.order_ref, None);
    assert_eq!(h.instance(instance.id).await.status, InstanceStatus::Stopping);

    let reconciler = h.services.task_reconciler();
    reconciler.sweep_at(Utc::now()).await.unwrap();
    reconciler.sweep_at(Utc::now()).await.unwrap();

    let task = h.services.saga.task(USER, task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(h.instance(instance.id).await.status, InstanceStatus::Active);
}

#[tokio::test]
async fn test_operation_guards() {
    let h = harness().await;
    h.fund(USER, "30").await;
    h.provisioned_order(USER).await;
    let instance = h.only_instance(USER).await;
    let service = &h.services.instances;

    assert!(matches!(
        service.operate(OTHER_USER, instance.id, InstanceAction::Reboot).await,
        Err(NimbusError::Forbidden { .. })
    ));

    // Drive the instance into suspension through billing.
    h.services.status_sync_reconciler().sweep_at(Utc::now()).await.unwrap();
    h.services.billing_reconciler().sweep_at(Utc::now()).await.unwrap();
    assert_eq!(h.instance(instance.id).await.status, InstanceStatus::Suspended);

    for action in [InstanceAction::Start, InstanceAction::Stop, InstanceAction::Reboot] {
        let err = service.operate(USER, instance.id, action).await.unwrap_err();
        assert!(matches!(err, NimbusError::InvalidOperation { .. }), "{:?}", action);
    }
    assert_eq!(h.mock.count_calls("start_instance"), 0);
    assert_eq!(h.mock.count_calls("reboot_instance"), 0);

    // Further sweeps leave the unpaid instance suspended.
    h.services.task_reconciler().sweep_at(Utc::now()).await.unwrap();
    h.services.task_reconciler().sweep_at(Utc::now()).await.unwrap();
    h.services.status_sync_reconciler().sweep_at(Utc::now()).await.unwrap();
    assert_eq!(h.instance(instance.id).await.status, InstanceStatus::Suspended);
    assert_eq!(h.balance(USER).await, common::dec("0"));
}

#[tokio::test]
async fn test_expired_instance_cannot_be_power_cycled() {
    let h = harness().await;
    h.fund(USER, "100").await;
    h.provisioned_order(USER).await;
    let instance = h.only_instance(USER).await;
    h.set_expiry(instance.id, Utc::now() - chrono::Duration::hours(1)).await;
    h.services.lifecycle_reconciler().sweep_at(Utc::now()).await.unwrap();
    assert_eq!(h.instance(instance.id).await.status, InstanceStatus::Expired);
    let stops = h.mock.count_calls("stop_instance");

    let service = &h.services.instances;
    for action in [InstanceAction::Stop, InstanceAction::Start, InstanceAction::Reboot] {
        let err = service.operate(USER, instance.id, action).await.unwrap_err();
        assert!(matches!(err, NimbusError::InvalidOperation { .. }), "{:?}", action);
    }

    let reconciler = h.services.task_reconciler();
    reconciler.sweep_at(Utc::now()).await.unwrap();
    reconciler.sweep_at(Utc::now()).await.unwrap();
    h.services.status_sync_reconciler().sweep_at(Utc::now()).await.unwrap();

    assert_eq!(h.instance(instance.id).await.status, InstanceStatus::Expired);
    assert_eq!(h.mock.count_calls("stop_instance"), stops);
    assert_eq!(h.mock.count_calls("start_instance"), 0);
}

#[tokio::test]
async fn test_deleted_instance_rejects_control() {
    let h = harness().await;
    h.fund(USER, "100").await;
    h.provisioned_order(USER).await;
    let instance = h.only_instance(USER).await;
    h.set_expiry(instance.id, Utc::now() - chrono::Duration::days(5)).await;
    h.services.lifecycle_reconciler().sweep_at(Utc::now()).await.unwrap();

    let err = h
        .services
        .instances
        .operate(USER, instance.id, InstanceAction::Start)
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::InvalidOperation { .. }));
}

#[tokio::test]
async fn test_instance_refreshes_from_control_plane() {
    let h = harness().await;
    h.fund(USER, "100").await;
    h.provisioned_order(USER).await;
    let instance = h.only_instance(USER).await;
    h.mock
        .set_instance_report(&instance.external_instance_id, "running", "10.1.2.3");

    let refreshed = h.services.instances.instance(USER, instance.id).await.unwrap();
    assert_eq!(refreshed.status, InstanceStatus::Running);
    assert_eq!(refreshed.ip, "10.1.2.3");
    assert_eq!(h.instance(instance.id).await.ip, "10.1.2.3");

    // An unreachable control plane returns the stored record.
    h.mock.fail_operation("get_instance_status");
    let stored = h.services.instances.instance(USER, instance.id).await.unwrap();
    assert_eq!(stored.ip, "10.1.2.3");
}

#[tokio::test]
async fn test_snapshot_records_follow_control_plane() {
    let h = harness().await;
    h.fund(USER, "100").await;
    h.provisioned_order(USER).await;
    let instance = h.only_instance(USER).await;
    let service = &h.services.instances;

    assert!(matches!(
        service.create_snapshot(USER, instance.id, "  ").await,
        Err(NimbusError::Validation { .. })
    ));

    let (_, snapshot) = service.create_snapshot(USER, instance.id, "before-upgrade").await.unwrap();
    assert_eq!(snapshot.status, "creating");
    service.create_snapshot(USER, instance.id, "nightly").await.unwrap();
    assert_eq!(service.snapshots(USER, instance.id).await.unwrap().len(), 2);

    service.restore_snapshot(USER, instance.id, "nightly").await.unwrap();
    service.delete_snapshot(USER, instance.id, "before-upgrade").await.unwrap();

    let names: Vec<_> = service
        .snapshots(USER, instance.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["nightly".to_string()]);
    assert_eq!(h.mock.count_calls("restore_snapshot"), 1);
}

#[tokio::test]
async fn test_console_and_metrics() {
    let h = harness().await;
    h.fund(USER, "100").await;
    h.provisioned_order(USER).await;
    let instance = h.only_instance(USER).await;

    let console = h.services.instances.console(USER, instance.id).await.unwrap();
    assert!(console.url.ends_with(&instance.external_instance_id));
    assert!(!console.ticket.is_empty());

    let metrics = h.services.instances.metrics(USER, instance.id).await.unwrap();
    assert!(metrics.cpu_usage > 0.0);
}
