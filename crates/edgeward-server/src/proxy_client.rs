//! Control-plane client abstraction
//!
//! The orchestrator only talks to the reverse proxy through this trait, so the real
//! HTTP-backed client and the offline simulated client are interchangeable. The variant is
//! picked once at startup and injected.

use async_trait::async_trait;
use thiserror::Error;

use crate::caddy_config::CaddyConfig;

/// Errors from control-plane operations
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Control plane unavailable: {0}")]
    Unavailable(String),

    #[error("Control plane rejected the configuration (status {status}): {reason}")]
    Rejected { status: u16, reason: String },
}

/// Routing and TLS configuration for one exposed domain
///
/// `document` carries only this domain's pieces; the client folds them into whatever the
/// control plane already serves for other domains.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub domain: String,
    pub document: CaddyConfig,
}

/// Request to stop exposing a domain
///
/// `fallback` is the allowlist-only configuration kept once the domain is gone; with no
/// other domain left the control plane serves exactly that, on plain HTTP.
#[derive(Debug, Clone)]
pub struct RemovalRequest {
    pub domain: String,
    pub fallback: CaddyConfig,
}

/// Certificate/route state of a domain as seen by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateState {
    /// Not routed and no TLS policy
    Absent,
    /// Configured, certificate not issued yet
    Pending,
    /// Routed with an issued certificate
    Active,
}

/// Trait for reverse-proxy control planes
#[async_trait]
pub trait ProxyConfigClient: Send + Sync {
    /// Whether this client only simulates the control plane
    fn is_simulated(&self) -> bool {
        false
    }

    /// Submit the configuration for a domain
    async fn apply(&self, config: &ProxyConfig) -> Result<(), ProxyError>;

    /// Remove a domain's route and TLS policy
    async fn remove(&self, request: &RemovalRequest) -> Result<(), ProxyError>;

    /// Current state of the domain's route and certificate
    async fn certificate_state(&self, domain: &str) -> Result<CertificateState, ProxyError>;

    /// Domains currently routed over TLS
    async fn active_domains(&self) -> Result<Vec<String>, ProxyError>;
}
