//! Wiring of the stateful services and reconcilers over one store

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::control_plane::ControlPlane;
use crate::instance_service::InstanceService;
use crate::ledger::{BillingService, Ledger};
use crate::notification::NotificationSink;
use crate::order_saga::OrderSaga;
use crate::reconciler::{
    BillingReconciler, LifecycleReconciler, ReconcilerSet, StatusSyncReconciler, TaskReconciler,
};
use crate::storage::Store;

/// Every service of a running node, sharing one store and control plane.
#[derive(Clone)]
pub struct NimbusServices {
    pub config: Config,
    pub store: Store,
    pub control_plane: Arc<dyn ControlPlane>,
    pub notifications: Arc<dyn NotificationSink>,
    pub catalog: Catalog,
    pub ledger: Ledger,
    pub billing: Arc<BillingService>,
    pub saga: Arc<OrderSaga>,
    pub instances: Arc<InstanceService>,
    pub shutdown: CancellationToken,
}

impl NimbusServices {
    pub fn new(
        config: Config,
        store: Store,
        control_plane: Arc<dyn ControlPlane>,
        notifications: Arc<dyn NotificationSink>,
        shutdown: CancellationToken,
    ) -> Self {
        let catalog = Catalog::new(store.clone());
        let ledger = Ledger::new(store.clone());
        let billing = Arc::new(BillingService::new(
            store.clone(),
            ledger.clone(),
            config.billing.min_recharge,
        ));
        let saga = Arc::new(OrderSaga::new(
            store.clone(),
            Arc::clone(&control_plane),
            config.billing.clone(),
            config.provisioning.clone(),
            shutdown.clone(),
        ));
        let instances = Arc::new(InstanceService::new(
            store.clone(),
            Arc::clone(&control_plane),
            shutdown.clone(),
        ));

        Self {
            config,
            store,
            control_plane,
            notifications,
            catalog,
            ledger,
            billing,
            saga,
            instances,
            shutdown,
        }
    }

    pub fn task_reconciler(&self) -> TaskReconciler {
        let r = &self.config.reconcilers;
        TaskReconciler::new(
            self.store.clone(),
            Arc::clone(&self.control_plane),
            Arc::clone(&self.saga),
            r.task_interval,
            r.dispatch_grace,
            self.config.billing.provision_period,
            self.shutdown.clone(),
        )
    }

    pub fn status_sync_reconciler(&self) -> StatusSyncReconciler {
        StatusSyncReconciler::new(
            self.store.clone(),
            Arc::clone(&self.control_plane),
            self.config.reconcilers.status_sync_interval,
            self.shutdown.clone(),
        )
    }

    pub fn billing_reconciler(&self) -> BillingReconciler {
        BillingReconciler::new(
            self.store.clone(),
            self.ledger.clone(),
            Arc::clone(&self.control_plane),
            Arc::clone(&self.notifications),
            self.config.billing.hourly_rate,
            self.config.reconcilers.billing_interval,
            self.shutdown.clone(),
        )
    }

    pub fn lifecycle_reconciler(&self) -> LifecycleReconciler {
        LifecycleReconciler::new(
            self.store.clone(),
            Arc::clone(&self.control_plane),
            Arc::clone(&self.notifications),
            self.config.reconcilers.lifecycle_interval,
            self.shutdown.clone(),
        )
    }

    /// Start the enabled reconcilers; they stop when `shutdown` is cancelled.
    pub fn spawn_reconcilers(&self) -> ReconcilerSet {
        let r = &self.config.reconcilers;
        let mut set = ReconcilerSet::new(self.shutdown.clone());
        if r.task_enabled {
            set.spawn(Arc::new(self.task_reconciler()));
        }
        if r.status_sync_enabled {
            set.spawn(Arc::new(self.status_sync_reconciler()));
        }
        if r.billing_enabled {
            set.spawn(Arc::new(self.billing_reconciler()));
        }
        if r.lifecycle_enabled {
            set.spawn(Arc::new(self.lifecycle_reconciler()));
        }
        set
    }
}
