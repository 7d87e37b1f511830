//! Register/deregister state machine
//!
//! Each operation runs as its own task in five steps, emitting one event per step. Any
//! failure aborts the remaining steps. The record is only written at the end, except when
//! confirmation times out: then it is marked FAILED because the control plane may already
//! hold the new configuration.

use std::sync::Arc;
use std::time::Duration;

use edgeward_protocol::TlsStatus;
use thiserror::Error;

use crate::caddy_config::{CaddyConfig, RouteSettings};
use crate::edge_policy::{Allowlist, DEFAULT_PARTNER_RANGES};
use crate::events::{self, ProgressSender, ProgressStream};
use crate::proxy_client::{
    CertificateState, ProxyConfig, ProxyConfigClient, ProxyError, RemovalRequest,
};
use crate::state::{AdminGuard, AdminLocks};
use crate::store::{AdminId, DomainRecord, DomainRecordStore, RecordUpdate, StoreError};

/// Errors returned before an operation starts
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("An operation is already running for administrator {0}")]
    Busy(AdminId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Control plane error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why an operation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Conflict,
    NotFound,
    RemoteUnavailable,
    RemoteRejected,
    ConfirmationTimeout,
    Store,
}

/// Terminal result of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub success: bool,
    /// TLS status of the record once the operation finished; `None` when the record
    /// could not be read
    pub status: Option<TlsStatus>,
    pub failure: Option<FailureKind>,
}

impl OperationOutcome {
    fn succeeded(status: TlsStatus) -> Self {
        Self {
            success: true,
            status: Some(status),
            failure: None,
        }
    }

    fn failed(kind: FailureKind, status: Option<TlsStatus>) -> Self {
        Self {
            success: false,
            status,
            failure: Some(kind),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub route: RouteSettings,
    pub partner_ranges: Vec<String>,
    /// Public IP of the proxy host, recorded on success
    pub proxy_host_ip: Option<String>,
    /// Upper bound for step 4
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            route: RouteSettings::default(),
            partner_ranges: DEFAULT_PARTNER_RANGES.iter().map(|s| s.to_string()).collect(),
            proxy_host_ip: None,
            confirm_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Record state next to what the control plane actually routes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStatus {
    pub record: DomainRecord,
    /// Every domain the control plane routes over TLS
    pub live_domains: Vec<String>,
    /// Live domains that no HTTPS or PENDING record accounts for
    pub unowned_domains: Vec<String>,
    /// Live state comes from the in-process simulation and says nothing about earlier runs
    pub simulated: bool,
}

impl DomainStatus {
    /// Whether the administrator's domain is routed right now
    pub fn is_live(&self) -> bool {
        self.record.has_domain() && self.live_domains.contains(&self.record.domain_name)
    }

    /// Whether the record and the control plane disagree
    pub fn diverged(&self) -> bool {
        match self.record.tls_status {
            TlsStatus::Https => !self.is_live(),
            TlsStatus::Http => !self.unowned_domains.is_empty(),
            TlsStatus::Pending | TlsStatus::Failed => true,
        }
    }
}

struct StepFailure {
    step: u8,
    kind: FailureKind,
    message: String,
    /// Record status left behind, if known
    status: Option<TlsStatus>,
}

impl StepFailure {
    fn new(
        step: u8,
        kind: FailureKind,
        status: impl Into<Option<TlsStatus>>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step,
            kind,
            message: message.into(),
            status: status.into(),
        }
    }
}

fn remote_failure(step: u8, status: TlsStatus, err: ProxyError) -> StepFailure {
    match err {
        ProxyError::Unavailable(reason) => StepFailure::new(
            step,
            FailureKind::RemoteUnavailable,
            status,
            format!("Control plane unreachable: {reason}"),
        ),
        ProxyError::Rejected {
            status: code,
            reason,
        } => StepFailure::new(
            step,
            FailureKind::RemoteRejected,
            status,
            format!("Control plane rejected the request (status {code}): {reason}"),
        ),
    }
}

/// Drives domain registration and deregistration against the control plane
pub struct DomainOrchestrator {
    client: Arc<dyn ProxyConfigClient>,
    store: Arc<dyn DomainRecordStore>,
    settings: OrchestratorSettings,
    locks: AdminLocks,
}

impl DomainOrchestrator {
    pub fn new(
        client: Arc<dyn ProxyConfigClient>,
        store: Arc<dyn DomainRecordStore>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            store,
            settings,
            locks: AdminLocks::new(),
        })
    }

    pub fn is_simulated(&self) -> bool {
        self.client.is_simulated()
    }

    /// Start exposing `domain` over HTTPS for the administrator
    ///
    /// Returns `Busy` immediately if another operation for the same administrator is running.
    pub fn register_domain(
        self: &Arc<Self>,
        admin_id: AdminId,
        domain: &str,
        email: &str,
    ) -> Result<ProgressStream, OrchestratorError> {
        let guard = self.acquire(admin_id)?;
        let (events, rx) = events::channel(self.client.is_simulated());

        let this = Arc::clone(self);
        let domain = domain.to_string();
        let email = email.to_string();
        let handle = tokio::spawn(async move {
            this.run_register(guard, admin_id, domain, email, events).await
        });

        Ok(ProgressStream::new(rx, handle))
    }

    /// Stop exposing the administrator's domain and fall back to plain HTTP
    pub fn deregister_domain(
        self: &Arc<Self>,
        admin_id: AdminId,
    ) -> Result<ProgressStream, OrchestratorError> {
        let guard = self.acquire(admin_id)?;
        let (events, rx) = events::channel(self.client.is_simulated());

        let this = Arc::clone(self);
        let handle =
            tokio::spawn(async move { this.run_deregister(guard, admin_id, events).await });

        Ok(ProgressStream::new(rx, handle))
    }

    /// Compare the stored record with the control plane's live configuration
    pub async fn status(&self, admin_id: AdminId) -> Result<DomainStatus, OrchestratorError> {
        let record = self.store.get(admin_id).await?;
        let live_domains = self.client.active_domains().await?;

        let mut unowned_domains = Vec::new();
        for domain in &live_domains {
            if self.store.find_active_owner(domain).await?.is_none() {
                unowned_domains.push(domain.clone());
            }
        }

        Ok(DomainStatus {
            record,
            live_domains,
            unowned_domains,
            simulated: self.client.is_simulated(),
        })
    }

    fn acquire(&self, admin_id: AdminId) -> Result<AdminGuard, OrchestratorError> {
        self.locks.try_acquire(admin_id).ok_or_else(|| {
            tracing::warn!(admin_id, "Rejected operation, another one is in flight");
            OrchestratorError::Busy(admin_id)
        })
    }

    async fn run_register(
        &self,
        _guard: AdminGuard,
        admin_id: AdminId,
        domain: String,
        email: String,
        mut events: ProgressSender,
    ) -> OperationOutcome {
        tracing::info!(admin_id, %domain, simulated = self.is_simulated(), "Registering domain");

        match self.register_steps(admin_id, &domain, &email, &mut events).await {
            Ok(()) => {
                tracing::info!(admin_id, %domain, "Domain registered");
                events
                    .success(5, format!("{domain} is now served over HTTPS"))
                    .await;
                OperationOutcome::succeeded(TlsStatus::Https)
            }
            Err(failure) => self.finish_failed(admin_id, failure, events).await,
        }
    }

    async fn register_steps(
        &self,
        admin_id: AdminId,
        raw_domain: &str,
        email: &str,
        events: &mut ProgressSender,
    ) -> Result<(), StepFailure> {
        // Step 1: validate input and look for conflicts
        let record = self.load_record(admin_id).await?;
        let before = record.tls_status;

        let domain = normalize_domain(raw_domain).ok_or_else(|| {
            StepFailure::new(
                1,
                FailureKind::Validation,
                before,
                format!("'{raw_domain}' is not a valid domain name"),
            )
        })?;

        if !is_valid_email(email) {
            return Err(StepFailure::new(
                1,
                FailureKind::Validation,
                before,
                format!("'{email}' is not a valid email address"),
            ));
        }

        if record.has_domain() && matches!(before, TlsStatus::Https | TlsStatus::Pending) {
            return Err(StepFailure::new(
                1,
                FailureKind::Conflict,
                before,
                format!(
                    "{} is already registered ({before}); deregister it first",
                    record.domain_name
                ),
            ));
        }

        match self.store.find_active_owner(&domain).await {
            Ok(Some(owner)) if owner != admin_id => {
                return Err(StepFailure::new(
                    1,
                    FailureKind::Conflict,
                    before,
                    format!("{domain} is already registered by another administrator"),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                return Err(StepFailure::new(
                    1,
                    FailureKind::Store,
                    before,
                    format!("Failed to check existing registrations: {e}"),
                ));
            }
        }

        events.progress(1, format!("Validated {domain}")).await;

        // Step 2: build the routing and TLS configuration
        let allowlist = self.allowlist(&record, 2)?;
        let config = ProxyConfig {
            domain: domain.clone(),
            document: CaddyConfig::domain_exposure(
                &domain,
                email,
                &self.settings.route,
                &allowlist,
            ),
        };
        events
            .progress(
                2,
                format!(
                    "Built configuration for {domain} ({} allowlisted ranges)",
                    allowlist.ranges().len()
                ),
            )
            .await;

        // Step 3: submit
        self.client
            .apply(&config)
            .await
            .map_err(|e| remote_failure(3, before, e))?;
        events
            .progress(3, "Configuration accepted by the control plane")
            .await;

        // Step 4: wait for the certificate
        if !self.wait_for(&domain, CertificateState::Active).await {
            let update = RecordUpdate {
                domain_name: domain.clone(),
                email: email.to_string(),
                tls_status: TlsStatus::Failed,
                proxy_host_ip: None,
                operator_ip: None,
            };
            return Err(self.confirmation_timeout(admin_id, &domain, update).await);
        }
        events
            .progress(4, format!("Certificate for {domain} is active"))
            .await;

        // Step 5: persist
        let update = RecordUpdate {
            domain_name: domain.clone(),
            email: email.to_string(),
            tls_status: TlsStatus::Https,
            proxy_host_ip: self.settings.proxy_host_ip.clone(),
            operator_ip: None,
        };
        self.persist_after_apply(admin_id, &domain, update, before)
            .await
    }

    async fn run_deregister(
        &self,
        _guard: AdminGuard,
        admin_id: AdminId,
        mut events: ProgressSender,
    ) -> OperationOutcome {
        tracing::info!(admin_id, simulated = self.is_simulated(), "Deregistering domain");

        match self.deregister_steps(admin_id, &mut events).await {
            Ok(domain) => {
                tracing::info!(admin_id, %domain, "Domain deregistered");
                events
                    .success(5, format!("{domain} removed, serving plain HTTP"))
                    .await;
                OperationOutcome::succeeded(TlsStatus::Http)
            }
            Err(failure) => self.finish_failed(admin_id, failure, events).await,
        }
    }

    async fn deregister_steps(
        &self,
        admin_id: AdminId,
        events: &mut ProgressSender,
    ) -> Result<String, StepFailure> {
        // Step 1: there must be something to remove
        let record = self.load_record(admin_id).await?;
        let before = record.tls_status;
        if !record.has_domain() || before == TlsStatus::Http {
            return Err(StepFailure::new(
                1,
                FailureKind::Validation,
                before,
                "No domain is registered",
            ));
        }
        let domain = record.domain_name.clone();
        events
            .progress(1, format!("Found {domain} ({before})"))
            .await;

        // Step 2: removal request with the HTTP-only fallback
        let allowlist = self.allowlist(&record, 2)?;
        let request = RemovalRequest {
            domain: domain.clone(),
            fallback: CaddyConfig::allowlist_only(&self.settings.route, &allowlist),
        };
        events
            .progress(2, format!("Built removal request for {domain}"))
            .await;

        // Step 3: submit
        self.client
            .remove(&request)
            .await
            .map_err(|e| remote_failure(3, before, e))?;
        events
            .progress(3, "Removal accepted by the control plane")
            .await;

        // Step 4: wait until the domain is gone
        if !self.wait_for(&domain, CertificateState::Absent).await {
            let update = RecordUpdate {
                domain_name: domain.clone(),
                email: record.email.clone(),
                tls_status: TlsStatus::Failed,
                proxy_host_ip: None,
                operator_ip: None,
            };
            return Err(self.confirmation_timeout(admin_id, &domain, update).await);
        }
        events
            .progress(4, format!("{domain} is no longer routed"))
            .await;

        // Step 5: reset the record
        self.persist_after_apply(admin_id, &domain, RecordUpdate::reset(), before)
            .await?;
        Ok(domain)
    }

    async fn finish_failed(
        &self,
        admin_id: AdminId,
        failure: StepFailure,
        events: ProgressSender,
    ) -> OperationOutcome {
        tracing::warn!(
            admin_id,
            step = failure.step,
            kind = ?failure.kind,
            "Operation failed: {}",
            failure.message
        );
        events.failure(failure.step, failure.message).await;
        OperationOutcome::failed(failure.kind, failure.status)
    }

    async fn load_record(&self, admin_id: AdminId) -> Result<DomainRecord, StepFailure> {
        self.store.get(admin_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => StepFailure::new(
                1,
                FailureKind::NotFound,
                None,
                format!("Administrator {admin_id} has no domain record"),
            ),
            other => StepFailure::new(
                1,
                FailureKind::Store,
                None,
                format!("Failed to load domain record: {other}"),
            ),
        })
    }

    fn allowlist(&self, record: &DomainRecord, step: u8) -> Result<Allowlist, StepFailure> {
        Allowlist::new(&record.operator_ip, &self.settings.partner_ranges).map_err(|e| {
            StepFailure::new(
                step,
                FailureKind::Validation,
                record.tls_status,
                format!("Cannot build allowlist: {e}"),
            )
        })
    }

    /// Poll the control plane until the domain reaches `target`, bounded by the confirm timeout
    async fn wait_for(&self, domain: &str, target: CertificateState) -> bool {
        let poll = async {
            loop {
                match self.client.certificate_state(domain).await {
                    Ok(state) if state == target => return,
                    Ok(state) => tracing::debug!(%domain, ?state, "Waiting for {:?}", target),
                    Err(e) => tracing::warn!(%domain, "Certificate state check failed: {}", e),
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        };

        tokio::time::timeout(self.settings.confirm_timeout, poll)
            .await
            .is_ok()
    }

    async fn confirmation_timeout(
        &self,
        admin_id: AdminId,
        domain: &str,
        update: RecordUpdate,
    ) -> StepFailure {
        let secs = self.settings.confirm_timeout.as_secs_f32();
        if let Err(e) = self.store.upsert(admin_id, update).await {
            tracing::error!(
                critical = true,
                admin_id,
                %domain,
                "Confirmation timed out and the FAILED status could not be stored: {}",
                e
            );
        }

        StepFailure::new(
            4,
            FailureKind::ConfirmationTimeout,
            TlsStatus::Failed,
            format!(
                "No confirmation for {domain} after {secs:.0}s; marked FAILED, manual reconciliation required"
            ),
        )
    }

    /// Write the terminal record; the control plane has already changed at this point
    async fn persist_after_apply(
        &self,
        admin_id: AdminId,
        domain: &str,
        update: RecordUpdate,
        before: TlsStatus,
    ) -> Result<(), StepFailure> {
        self.store.upsert(admin_id, update).await.map_err(|e| {
            tracing::error!(
                critical = true,
                admin_id,
                %domain,
                "Control plane updated but the domain record was not: {}",
                e
            );
            StepFailure::new(
                5,
                FailureKind::Store,
                before,
                format!(
                    "Control plane updated but saving the record failed ({e}); manual reconciliation required"
                ),
            )
        })
    }
}

/// Lowercased domain if it is a syntactically valid multi-label hostname
pub fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() || domain.len() > 253 {
        return None;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || !labels.iter().all(|label| is_valid_label(label)) {
        return None;
    }

    // The top-level label cannot be numeric, which also rules out IPv4 literals
    let tld = labels.last()?;
    if tld.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some(domain)
}

fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

pub fn is_valid_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, host)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty() && !host.contains('@') && normalize_domain(host).is_some()
}
