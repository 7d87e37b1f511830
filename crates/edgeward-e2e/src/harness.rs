//! Test environment for E2E tests
//!
//! Provides an in-memory record store with provisioned administrators and settings with
//! short timeouts, plus helpers to wire an orchestrator to any control-plane client.

use std::sync::Arc;
use std::time::Duration;

use edgeward_server::{
    AdminId, CaddyClient, CaddyClientConfig, DomainOrchestrator, DomainRecord,
    DomainRecordStore, OrchestratorSettings, ProxyConfigClient, SimulatedProxyClient,
    SimulationSettings, SqliteDomainStore,
};

use crate::mock_control_plane::MockControlPlane;

/// Public IP recorded for the proxy host in tests
pub const PROXY_HOST_IP: &str = "198.51.100.1";

/// Initialize tracing for tests
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("edgeward_server=debug,edgeward_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// Operator IP assigned to an administrator
pub fn operator_ip(admin_id: AdminId) -> String {
    format!("203.0.113.{}", admin_id)
}

/// Orchestrator settings with short polling and timeouts
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        proxy_host_ip: Some(PROXY_HOST_IP.to_string()),
        confirm_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Simulated backend timings compatible with [`fast_settings`]
pub fn fast_simulation() -> SimulationSettings {
    SimulationSettings {
        step_delay: Duration::from_millis(5),
        confirm_delay: Duration::from_millis(30),
    }
}

/// A record store with provisioned administrators
pub struct TestEnv {
    pub store: Arc<SqliteDomainStore>,
}

impl TestEnv {
    /// Create an in-memory store and provision each administrator
    pub async fn with_admins(admins: &[AdminId]) -> Self {
        let store = SqliteDomainStore::connect_in_memory()
            .await
            .expect("Failed to open in-memory store");

        for &admin in admins {
            store
                .provision_admin(admin, "test-credential-hash", &operator_ip(admin))
                .await
                .expect("Failed to provision administrator");
        }

        Self {
            store: Arc::new(store),
        }
    }

    /// Orchestrator over this store and the given client
    pub fn orchestrator(&self, client: Arc<dyn ProxyConfigClient>) -> Arc<DomainOrchestrator> {
        self.orchestrator_with(client, self.store.clone(), fast_settings())
    }

    pub fn orchestrator_with(
        &self,
        client: Arc<dyn ProxyConfigClient>,
        store: Arc<dyn DomainRecordStore>,
        settings: OrchestratorSettings,
    ) -> Arc<DomainOrchestrator> {
        DomainOrchestrator::new(client, store, settings)
    }

    /// Orchestrator over the simulated backend
    pub fn simulated(&self) -> Arc<DomainOrchestrator> {
        self.orchestrator(Arc::new(SimulatedProxyClient::new(fast_simulation())))
    }

    /// Orchestrator over the real HTTP client pointed at a mock control plane
    pub fn real(&self, control_plane: &MockControlPlane) -> Arc<DomainOrchestrator> {
        let client = CaddyClient::new(&CaddyClientConfig {
            admin_url: control_plane.url(),
            request_timeout: Duration::from_secs(2),
            certificate_dir: None,
        })
        .expect("Failed to build control-plane client");
        self.orchestrator(Arc::new(client))
    }

    /// Current record of an administrator
    pub async fn record(&self, admin_id: AdminId) -> DomainRecord {
        self.store
            .get(admin_id)
            .await
            .expect("Failed to load domain record")
    }
}
