use std::sync::Arc;

use nimbus_core::{
    config::Config,
    control_plane::ControlPlaneRegistry,
    error::NimbusResult,
    notification::{LogNotificationSink, NotificationSink},
    reconciler::ReconcilerSet,
    services::NimbusServices,
    storage::Store,
};
use tokio_util::sync::CancellationToken;

/// Runs one Nimbus node: the store, the control plane client and the
/// reconciliation loops.
///
/// ```text
/// ┌──────────────────────────────────────────┐
/// │            NimbusOrchestrator            │
/// ├──────────────────────────────────────────┤
/// │  • Configuration                         │
/// │  • Component lifecycle                   │
/// └──────────────────────────────────────────┘
///          │                      │
///          ▼                      ▼
/// ┌──────────────────┐   ┌──────────────────┐
/// │   nimbus-core    │   │ nimbus-capability│
/// │                  │   │                  │
/// │ • Ledger         │   │ • Signed HTTP    │
/// │ • Order saga     │   │ • Retry/breaker  │
/// │ • Reconcilers    │   │                  │
/// │ • redb store     │   │                  │
/// └──────────────────┘   └──────────────────┘
/// ```
pub struct NimbusOrchestrator {
    services: NimbusServices,
    reconcilers: Option<ReconcilerSet>,
}

impl NimbusOrchestrator {
    /// Open the store and build the configured control plane backend.
    pub fn new(config: Config) -> NimbusResult<Self> {
        Self::with_registry(config, nimbus_capability::registry())
    }

    pub fn with_registry(config: Config, registry: ControlPlaneRegistry) -> NimbusResult<Self> {
        config.validate()?;
        tracing::info!(
            "Creating Nimbus orchestrator with {} control plane, data in {}",
            config.node.control_plane,
            config.node.data_dir.display()
        );

        let store = Store::open(&config.node.data_dir)?;
        let control_plane = registry.create(&config.node.control_plane, &config.control_plane)?;
        let notifications: Arc<dyn NotificationSink> = Arc::new(LogNotificationSink);

        let services = NimbusServices::new(config, store, control_plane, notifications, CancellationToken::new());
        Ok(Self {
            services,
            reconcilers: None,
        })
    }

    /// Spawn the enabled reconcilers.
    pub fn start(&mut self) {
        if self.reconcilers.is_some() {
            return;
        }
        let set = self.services.spawn_reconcilers();
        tracing::info!("Started reconcilers: {:?}", set.names());
        self.reconcilers = Some(set);
    }

    /// Cancel every loop and in-flight control plane call and wait for the loops to exit.
    pub async fn stop(&mut self) {
        tracing::info!("Stopping Nimbus orchestrator");
        if let Some(set) = self.reconcilers.take() {
            set.shutdown().await;
        } else {
            self.services.shutdown.cancel();
        }
        tracing::info!("Nimbus orchestrator stopped");
    }

    pub fn services(&self) -> &NimbusServices {
        &self.services
    }

    pub fn is_running(&self) -> bool {
        self.reconcilers.is_some()
    }
}
