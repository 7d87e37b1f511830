//! Scripted control-plane client for E2E tests
//!
//! Records every call with the administrator-visible domain and can be told to fail,
//! stall, or never confirm, without any network involved. Applied domains are kept side by
//! side, like a control plane shared by several administrators.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use edgeward_server::{
    CertificateState, ProxyConfig, ProxyConfigClient, ProxyError, RemovalRequest,
};

/// One recorded client call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCall {
    Apply(String),
    Remove(String),
}

/// How `apply` or `remove` should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    None,
    Unavailable,
    Rejected(u16),
}

impl ScriptedFailure {
    fn check(self) -> Result<(), ProxyError> {
        match self {
            ScriptedFailure::None => Ok(()),
            ScriptedFailure::Unavailable => {
                Err(ProxyError::Unavailable("connection refused".into()))
            }
            ScriptedFailure::Rejected(status) => Err(ProxyError::Rejected {
                status,
                reason: "scripted rejection".into(),
            }),
        }
    }
}

pub struct ScriptedProxyClient {
    calls: Mutex<Vec<ProxyCall>>,
    /// Applied domains
    active: DashMap<String, ()>,
    fail_apply: Mutex<ScriptedFailure>,
    fail_remove: Mutex<ScriptedFailure>,
    never_confirm: AtomicBool,
    /// Acknowledge removals but keep routing the domain
    never_release: AtomicBool,
    /// Delay for apply/remove in milliseconds
    delay_ms: AtomicU64,
}

impl ScriptedProxyClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ProxyCall> {
        self.calls.lock().clone()
    }

    pub fn is_active(&self, domain: &str) -> bool {
        self.active.contains_key(domain)
    }

    pub fn set_fail_apply(&self, failure: ScriptedFailure) {
        *self.fail_apply.lock() = failure;
    }

    pub fn set_fail_remove(&self, failure: ScriptedFailure) {
        *self.fail_remove.lock() = failure;
    }

    /// Accept removals but keep the domain routed, so it never reads as absent
    pub fn set_never_release(&self, never: bool) {
        self.never_release.store(never, Ordering::SeqCst);
    }

    /// Accept applies but never report the certificate as active
    pub fn set_never_confirm(&self, never: bool) {
        self.never_confirm.store(never, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(&self) {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

impl Default for ScriptedProxyClient {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            active: DashMap::new(),
            fail_apply: Mutex::new(ScriptedFailure::None),
            fail_remove: Mutex::new(ScriptedFailure::None),
            never_confirm: AtomicBool::new(false),
            never_release: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ProxyConfigClient for ScriptedProxyClient {
    async fn apply(&self, config: &ProxyConfig) -> Result<(), ProxyError> {
        self.calls.lock().push(ProxyCall::Apply(config.domain.clone()));
        self.pause().await;

        let failure = *self.fail_apply.lock();
        failure.check()?;

        self.active.insert(config.domain.clone(), ());
        tracing::debug!("ScriptedProxyClient: applied {}", config.domain);
        Ok(())
    }

    async fn remove(&self, request: &RemovalRequest) -> Result<(), ProxyError> {
        self.calls.lock().push(ProxyCall::Remove(request.domain.clone()));
        self.pause().await;

        let failure = *self.fail_remove.lock();
        failure.check()?;

        if !self.never_release.load(Ordering::SeqCst) {
            self.active.remove(&request.domain);
        }
        tracing::debug!("ScriptedProxyClient: removed {}", request.domain);
        Ok(())
    }

    async fn certificate_state(&self, domain: &str) -> Result<CertificateState, ProxyError> {
        if !self.active.contains_key(domain) {
            return Ok(CertificateState::Absent);
        }
        if self.never_confirm.load(Ordering::SeqCst) {
            return Ok(CertificateState::Pending);
        }
        Ok(CertificateState::Active)
    }

    async fn active_domains(&self) -> Result<Vec<String>, ProxyError> {
        let mut domains: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
        domains.sort();
        Ok(domains)
    }
}
