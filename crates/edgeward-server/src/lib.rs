//! Edgeward domain exposure orchestrator
//!
//! This library drives a Caddy-style reverse proxy to expose one domain per administrator
//! over HTTPS, streams per-step progress, and records the outcome. It also generates the
//! proxy's static edge policy and manages certificate backups for deployments.

mod caddy;
mod caddy_config;
mod cert_archive;
mod config;
mod edge_policy;
mod events;
mod orchestrator;
mod proxy_client;
mod simulated;
mod state;
mod store;

// Re-export public types
pub use caddy::{CaddyClient, CaddyClientConfig};
pub use caddy_config::{route_id, CaddyConfig, Handler, RouteSettings, DENY_BODY, DENY_STATUS};
pub use cert_archive::{ArchiveError, CertArchive, DeploymentReport};
pub use config::{ResolvedServerConfig, ServerConfig};
pub use edge_policy::{
    Allowlist, EdgePolicy, EdgePolicyConfig, IpRange, PolicyError, DEFAULT_PARTNER_RANGES,
};
pub use events::{ProgressSender, ProgressStream};
pub use orchestrator::{
    is_valid_email, normalize_domain, DomainOrchestrator, DomainStatus, FailureKind,
    OperationOutcome, OrchestratorError, OrchestratorSettings,
};
pub use proxy_client::{
    CertificateState, ProxyConfig, ProxyConfigClient, ProxyError, RemovalRequest,
};
pub use simulated::{SimulatedProxyClient, SimulationSettings};
pub use state::AdminLocks;
pub use store::{
    AdminId, DomainRecord, DomainRecordStore, RecordUpdate, SqliteDomainStore, StoreError,
};
