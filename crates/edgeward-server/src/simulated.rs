//! Offline stand-in for the control plane
//!
//! Never performs I/O. Each call waits a short fixed delay and acknowledges; an applied
//! domain reports its certificate as active once the confirmation delay has elapsed.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use edgeward_protocol::SIMULATION_MARKER;
use tokio::time::Instant;

use crate::proxy_client::{
    CertificateState, ProxyConfig, ProxyConfigClient, ProxyError, RemovalRequest,
};

#[derive(Debug, Clone)]
pub struct SimulationSettings {
    /// Delay for each apply/remove call
    pub step_delay: Duration,
    /// Time between apply and the certificate reporting active
    pub confirm_delay: Duration,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(500),
            confirm_delay: Duration::from_secs(5),
        }
    }
}

pub struct SimulatedProxyClient {
    settings: SimulationSettings,
    /// Applied domains and when they were applied
    applied: DashMap<String, Instant>,
}

impl SimulatedProxyClient {
    pub fn new(settings: SimulationSettings) -> Self {
        Self {
            settings,
            applied: DashMap::new(),
        }
    }
}

impl Default for SimulatedProxyClient {
    fn default() -> Self {
        Self::new(SimulationSettings::default())
    }
}

#[async_trait]
impl ProxyConfigClient for SimulatedProxyClient {
    fn is_simulated(&self) -> bool {
        true
    }

    async fn apply(&self, config: &ProxyConfig) -> Result<(), ProxyError> {
        tokio::time::sleep(self.settings.step_delay).await;
        self.applied.insert(config.domain.clone(), Instant::now());
        tracing::info!(domain = %config.domain, "{} Applied domain configuration", SIMULATION_MARKER);
        Ok(())
    }

    async fn remove(&self, request: &RemovalRequest) -> Result<(), ProxyError> {
        tokio::time::sleep(self.settings.step_delay).await;
        self.applied.remove(&request.domain);
        tracing::info!(domain = %request.domain, "{} Removed domain configuration", SIMULATION_MARKER);
        Ok(())
    }

    async fn certificate_state(&self, domain: &str) -> Result<CertificateState, ProxyError> {
        let Some(applied_at) = self.applied.get(domain).map(|entry| *entry.value()) else {
            return Ok(CertificateState::Absent);
        };

        if applied_at.elapsed() >= self.settings.confirm_delay {
            Ok(CertificateState::Active)
        } else {
            Ok(CertificateState::Pending)
        }
    }

    async fn active_domains(&self) -> Result<Vec<String>, ProxyError> {
        let mut domains: Vec<String> = self.applied.iter().map(|entry| entry.key().clone()).collect();
        domains.sort();
        Ok(domains)
    }
}
