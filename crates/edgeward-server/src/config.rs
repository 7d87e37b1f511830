//! Orchestrator configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (EDGEWARD_*)
//! 2. Config file (edgeward.toml)
//! 3. Default values

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::caddy::CaddyClientConfig;
use crate::caddy_config::RouteSettings;
use crate::edge_policy::{EdgePolicyConfig, DEFAULT_ADMIN_LISTEN, DEFAULT_PARTNER_RANGES};
use crate::orchestrator::OrchestratorSettings;
use crate::simulated::SimulationSettings;

/// Environment variable prefix
const ENV_PREFIX: &str = "EDGEWARD";

/// Configuration as parsed from TOML, every field optional
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// SQLite connection URL
    pub database_url: Option<String>,

    /// Use the simulated control plane instead of the real one
    pub simulate: Option<bool>,

    /// Public IP of this host, recorded with every registration
    pub proxy_host_ip: Option<String>,

    pub control_plane: Option<ControlPlaneConfig>,

    pub simulation: Option<SimulationConfig>,

    pub edge: Option<EdgeConfig>,

    pub certificates: Option<CertificatesConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Admin API base URL; must point at a loopback address
    pub admin_url: Option<String>,
    pub server_id: Option<String>,
    /// Application address the proxy forwards to
    pub upstream: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub confirm_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    /// Caddy data directory, used to check for issued certificate files
    pub certificate_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SimulationConfig {
    pub step_delay_ms: Option<u64>,
    pub confirm_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct EdgeConfig {
    /// Partner ranges always allowed through, in addition to the operator's IP
    pub partner_ranges: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CertificatesConfig {
    pub storage_dir: Option<String>,
    pub archive_dir: Option<String>,
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub database_url: String,
    pub simulate: bool,
    /// Unset until detected when neither the environment nor the file provides it
    pub proxy_host_ip: Option<String>,
    pub control_plane: ResolvedControlPlane,
    pub simulation: SimulationSettings,
    pub partner_ranges: Vec<String>,
    pub storage_dir: PathBuf,
    pub archive_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedControlPlane {
    pub admin_url: String,
    pub admin_listen: SocketAddr,
    pub route: RouteSettings,
    pub request_timeout: Duration,
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
    pub certificate_dir: Option<PathBuf>,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Admin API address from its URL; only loopback hosts are accepted
fn admin_listen_addr(admin_url: &str) -> anyhow::Result<SocketAddr> {
    let url = Url::parse(admin_url)
        .map_err(|e| anyhow::anyhow!("Invalid admin URL '{}': {}", admin_url, e))?;
    let port = url.port_or_known_default().unwrap_or(2019);

    let ip = match url.host_str() {
        Some("localhost") => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| anyhow::anyhow!("Admin URL host '{}' is not an IP address", host))?,
        None => anyhow::bail!("Admin URL '{}' has no host", admin_url),
    };

    if !ip.is_loopback() {
        anyhow::bail!(
            "Admin URL must point at a loopback address, got {}. The admin API must never be exposed",
            ip
        );
    }

    Ok(SocketAddr::new(ip, port))
}

/// Auto-detect public IP address using external services
async fn detect_public_ip() -> anyhow::Result<String> {
    // Try multiple services in case one is down
    let services = [
        "https://api.ipify.org",
        "https://ifconfig.me/ip",
        "https://icanhazip.com",
    ];

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    for service in services {
        match client.get(service).send().await {
            Ok(response) => {
                if let Ok(body) = response.text().await {
                    let ip = body.trim();
                    if ip.parse::<IpAddr>().is_ok() {
                        tracing::info!("Detected public IP: {}", ip);
                        return Ok(ip.to_string());
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Failed to get IP from {}: {}", service, e);
            }
        }
    }

    anyhow::bail!(
        "Could not auto-detect proxy host IP. Set EDGEWARD_PROXY_HOST_IP or proxy_host_ip in config"
    )
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        self.resolve_with(get_env)
    }

    fn resolve_with<F>(self, env: F) -> anyhow::Result<ResolvedServerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_u64 = |name: &str| env(name).and_then(|v| v.parse::<u64>().ok());

        // Database: ENV > config > default
        let database_url = env("DATABASE_URL")
            .or(self.database_url)
            .unwrap_or_else(|| "sqlite://edgeward.db".to_string());

        // Backend selection, read once here
        let simulate = env("SIMULATE")
            .and_then(|v| parse_bool(&v))
            .or(self.simulate)
            .unwrap_or(false);

        let cp = self.control_plane.unwrap_or_default();
        let admin_url = env("ADMIN_URL")
            .or(cp.admin_url)
            .unwrap_or_else(|| format!("http://{}", DEFAULT_ADMIN_LISTEN));
        let admin_listen = admin_listen_addr(&admin_url)?;

        let defaults = RouteSettings::default();
        let route = RouteSettings {
            server_id: cp.server_id.unwrap_or(defaults.server_id),
            upstream: env("UPSTREAM").or(cp.upstream).unwrap_or(defaults.upstream),
        };

        let control_plane = ResolvedControlPlane {
            admin_url,
            admin_listen,
            route,
            request_timeout: Duration::from_secs(
                env_u64("REQUEST_TIMEOUT_SECS")
                    .or(cp.request_timeout_secs)
                    .unwrap_or(5),
            ),
            confirm_timeout: Duration::from_secs(
                env_u64("CONFIRM_TIMEOUT_SECS")
                    .or(cp.confirm_timeout_secs)
                    .unwrap_or(10),
            ),
            poll_interval: Duration::from_millis(
                env_u64("POLL_INTERVAL_MS")
                    .or(cp.poll_interval_ms)
                    .unwrap_or(1000),
            ),
            certificate_dir: env("CERTIFICATE_DIR")
                .or(cp.certificate_dir)
                .map(PathBuf::from),
        };

        let sim = self.simulation.unwrap_or_default();
        let simulation = SimulationSettings {
            step_delay: Duration::from_millis(sim.step_delay_ms.unwrap_or(500)),
            confirm_delay: Duration::from_secs(sim.confirm_delay_secs.unwrap_or(5)),
        };

        if simulate && simulation.confirm_delay >= control_plane.confirm_timeout {
            tracing::warn!(
                "Simulated confirmation delay ({:?}) is not shorter than the confirm timeout ({:?}); registrations will time out",
                simulation.confirm_delay,
                control_plane.confirm_timeout
            );
        }

        let partner_ranges = self
            .edge
            .and_then(|edge| edge.partner_ranges)
            .unwrap_or_else(|| DEFAULT_PARTNER_RANGES.iter().map(|s| s.to_string()).collect());

        let certs = self.certificates.unwrap_or_default();
        let storage_dir = env("CERT_STORAGE_DIR")
            .or(certs.storage_dir)
            .unwrap_or_else(|| "/var/lib/caddy/.local/share/caddy".to_string());
        let archive_dir = env("CERT_ARCHIVE_DIR")
            .or(certs.archive_dir)
            .unwrap_or_else(|| "/var/backups/edgeward".to_string());

        // Proxy host IP: ENV > config > loopback (simulated); real mode detects it on demand
        let proxy_host_ip = env("PROXY_HOST_IP")
            .or(self.proxy_host_ip)
            .or_else(|| simulate.then(|| "127.0.0.1".to_string()));

        Ok(ResolvedServerConfig {
            database_url,
            simulate,
            proxy_host_ip,
            control_plane,
            simulation,
            partner_ranges,
            storage_dir: PathBuf::from(storage_dir),
            archive_dir: PathBuf::from(archive_dir),
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        Self::load(path).resolve()
    }
}

impl ResolvedServerConfig {
    /// Fill in the proxy host IP from a public lookup if it is still unknown
    pub async fn detect_proxy_host_ip(&mut self) -> anyhow::Result<&str> {
        if self.proxy_host_ip.is_none() {
            tracing::info!("Proxy host IP not configured, auto-detecting...");
            self.proxy_host_ip = Some(detect_public_ip().await?);
        }
        Ok(self.proxy_host_ip.as_deref().unwrap_or_default())
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            route: self.control_plane.route.clone(),
            partner_ranges: self.partner_ranges.clone(),
            proxy_host_ip: self.proxy_host_ip.clone(),
            confirm_timeout: self.control_plane.confirm_timeout,
            poll_interval: self.control_plane.poll_interval,
        }
    }

    pub fn caddy_client_config(&self) -> CaddyClientConfig {
        CaddyClientConfig {
            admin_url: self.control_plane.admin_url.clone(),
            request_timeout: self.control_plane.request_timeout,
            certificate_dir: self.control_plane.certificate_dir.clone(),
        }
    }

    pub fn edge_policy_config(&self) -> EdgePolicyConfig {
        EdgePolicyConfig {
            admin_listen: self.control_plane.admin_listen,
            route: self.control_plane.route.clone(),
            partner_ranges: self.partner_ranges.clone(),
        }
    }
}
