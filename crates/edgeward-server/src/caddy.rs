use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::caddy_config::{CaddyConfig, TlsPolicy};
use crate::proxy_client::{
    CertificateState, ProxyConfig, ProxyConfigClient, ProxyError, RemovalRequest,
};

/// Connection settings for the control plane's admin API
#[derive(Debug, Clone)]
pub struct CaddyClientConfig {
    /// Base URL of the admin API, always a loopback address
    pub admin_url: String,
    pub request_timeout: Duration,
    /// Caddy data directory; when set, a certificate counts as issued only once its file exists
    pub certificate_dir: Option<PathBuf>,
}

/// Control-plane client that talks to the Caddy admin API over HTTP
///
/// Changes read the live configuration, fold the domain in or out, and load the result,
/// so other administrators' domains survive. Requests use a fixed timeout and no retries;
/// the remote status is surfaced as-is.
pub struct CaddyClient {
    client: Client,
    admin_url: String,
    certificate_dir: Option<PathBuf>,
    /// Serializes read-modify-load cycles
    writes: Mutex<()>,
}

#[derive(Debug, Deserialize)]
struct AdminErrorBody {
    error: String,
}

impl CaddyClient {
    pub fn new(config: &CaddyClientConfig) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProxyError::Unavailable(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            admin_url: config.admin_url.trim_end_matches('/').to_string(),
            certificate_dir: config.certificate_dir.clone(),
            writes: Mutex::new(()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.admin_url, path)
    }

    async fn load(&self, document: &CaddyConfig) -> Result<(), ProxyError> {
        let response = self
            .client
            .post(self.url("/load"))
            .json(document)
            .send()
            .await
            .map_err(unavailable)?;

        check_status(response).await.map(|_| ())
    }

    async fn get_json(&self, path: &str) -> Result<Value, ProxyError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(unavailable)?;

        let response = check_status(response).await?;
        let body = response.text().await.map_err(unavailable)?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(unreadable)
    }

    /// Live configuration; an empty control plane reads as the default document
    async fn read_config(&self) -> Result<CaddyConfig, ProxyError> {
        match self.get_json("/config/").await? {
            Value::Null => Ok(CaddyConfig::default()),
            value => serde_json::from_value(value).map_err(unreadable),
        }
    }

    /// Read the live configuration, let `change` edit it, and load the result
    async fn update<F>(&self, change: F) -> Result<(), ProxyError>
    where
        F: FnOnce(&mut CaddyConfig),
    {
        let _writing = self.writes.lock().await;
        let mut document = self.read_config().await?;
        change(&mut document);
        self.load(&document).await
    }
}

fn unreadable(err: serde_json::Error) -> ProxyError {
    ProxyError::Rejected {
        status: 200,
        reason: format!("Unreadable admin API response: {err}"),
    }
}

fn unavailable(err: reqwest::Error) -> ProxyError {
    ProxyError::Unavailable(err.to_string())
}

/// Map a non-2xx response to `Rejected`, keeping the admin API's own error message
async fn check_status(response: Response) -> Result<Response, ProxyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProxyError::Rejected {
        status: status.as_u16(),
        reason: rejection_reason(&body, status.canonical_reason()),
    })
}

fn rejection_reason(body: &str, canonical: Option<&str>) -> String {
    if let Ok(parsed) = serde_json::from_str::<AdminErrorBody>(body) {
        return parsed.error;
    }

    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }

    canonical.unwrap_or("unknown error").to_string()
}

/// Look for `certificates/<issuer>/<domain>/<domain>.crt` under the Caddy data directory
async fn certificate_issued(data_dir: &Path, domain: &str) -> bool {
    let Ok(mut issuers) = tokio::fs::read_dir(data_dir.join("certificates")).await else {
        return false;
    };

    while let Ok(Some(issuer)) = issuers.next_entry().await {
        let cert = issuer
            .path()
            .join(domain)
            .join(format!("{domain}.crt"));
        if tokio::fs::try_exists(&cert).await.unwrap_or(false) {
            return true;
        }
    }

    false
}

#[async_trait]
impl ProxyConfigClient for CaddyClient {
    async fn apply(&self, config: &ProxyConfig) -> Result<(), ProxyError> {
        tracing::info!(domain = %config.domain, "Loading domain configuration into control plane");
        self.update(|live| live.merge_exposure(&config.domain, &config.document))
            .await
    }

    async fn remove(&self, request: &RemovalRequest) -> Result<(), ProxyError> {
        tracing::info!(domain = %request.domain, "Removing domain from control plane");
        self.update(|live| live.remove_domain(&request.domain, &request.fallback))
            .await
    }

    async fn certificate_state(&self, domain: &str) -> Result<CertificateState, ProxyError> {
        let policies: Vec<TlsPolicy> =
            match self.get_json("/config/apps/tls/automation/policies").await? {
                Value::Null => Vec::new(),
                value => serde_json::from_value(value).map_err(unreadable)?,
            };

        if !policies
            .iter()
            .any(|policy| policy.subjects.iter().any(|s| s == domain))
        {
            return Ok(CertificateState::Absent);
        }

        match &self.certificate_dir {
            Some(dir) if !certificate_issued(dir, domain).await => Ok(CertificateState::Pending),
            _ => Ok(CertificateState::Active),
        }
    }

    async fn active_domains(&self) -> Result<Vec<String>, ProxyError> {
        let config = self.read_config().await?;
        let hosts = config.routed_hosts();

        Ok(config
            .tls_subjects()
            .into_iter()
            .filter(|subject| hosts.contains(subject))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_reason_prefers_admin_error() {
        assert_eq!(
            rejection_reason(r#"{"error":"loading config: bad listener"}"#, Some("Bad Request")),
            "loading config: bad listener"
        );
        assert_eq!(rejection_reason("  plain text  ", None), "plain text");
        assert_eq!(rejection_reason("", Some("Bad Request")), "Bad Request");
        assert_eq!(rejection_reason("", None), "unknown error");
    }

    #[tokio::test]
    async fn test_certificate_file_lookup() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!certificate_issued(dir.path(), "site.example.com").await);

        let cert_dir = dir
            .path()
            .join("certificates")
            .join("acme-v02.api.letsencrypt.org-directory")
            .join("site.example.com");
        std::fs::create_dir_all(&cert_dir).unwrap();
        assert!(!certificate_issued(dir.path(), "site.example.com").await);

        std::fs::write(cert_dir.join("site.example.com.crt"), b"-----BEGIN CERTIFICATE-----").unwrap();
        assert!(certificate_issued(dir.path(), "site.example.com").await);
        assert!(!certificate_issued(dir.path(), "other.example.com").await);
    }

    #[test]
    fn test_admin_url_trailing_slash() {
        let client = CaddyClient::new(&CaddyClientConfig {
            admin_url: "http://127.0.0.1:2019/".to_string(),
            request_timeout: Duration::from_secs(1),
            certificate_dir: None,
        })
        .unwrap();
        assert_eq!(client.url("/load"), "http://127.0.0.1:2019/load");
    }
}
