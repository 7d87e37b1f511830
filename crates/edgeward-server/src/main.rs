use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgeward_protocol::{EventStatus, SseCodec};
use futures_util::SinkExt;
use tokio_util::codec::FramedWrite;
use tracing_subscriber::EnvFilter;

use edgeward_server::{
    AdminId, CaddyClient, CertArchive, DomainOrchestrator, DomainRecordStore, DomainStatus,
    EdgePolicy, ProgressStream, ProxyConfigClient, ResolvedServerConfig, ServerConfig,
    SimulatedProxyClient, SqliteDomainStore,
};

/// Edgeward - expose one domain per administrator through a Caddy control plane
#[derive(Parser, Debug)]
#[command(name = "edgeward")]
#[command(about = "Register domains with automatic TLS on a Caddy reverse proxy")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "edgeward.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an administrator and its default HTTP record
    Provision {
        #[arg(long)]
        admin: AdminId,
        /// Hash of the administrator's credential
        #[arg(long)]
        credential_hash: String,
        /// Operator's home IP, always allowlisted
        #[arg(long)]
        operator_ip: String,
        /// Record that the administrator accepted the terms of use
        #[arg(long)]
        agreed: bool,
    },

    /// Expose a domain over HTTPS
    Register {
        #[arg(long)]
        admin: AdminId,
        #[arg(long)]
        domain: String,
        /// Contact address for the ACME account
        #[arg(long)]
        email: String,
        /// Write progress as Server-Sent Events instead of log lines
        #[arg(long)]
        sse: bool,
    },

    /// Remove the administrator's domain and fall back to plain HTTP
    Deregister {
        #[arg(long)]
        admin: AdminId,
        #[arg(long)]
        sse: bool,
    },

    /// Show the stored record next to what the control plane routes
    Status {
        #[arg(long)]
        admin: AdminId,
    },

    /// Print the static edge policy for an operator IP
    EdgeConfig {
        #[arg(long)]
        operator_ip: String,
        /// Render as a Caddyfile instead of JSON
        #[arg(long)]
        caddyfile: bool,
    },

    /// Restore the newest certificate archive, then take a fresh one
    PrepareCerts {
        /// Seconds between stability checks
        #[arg(long, default_value_t = 2)]
        settle_secs: u64,
        #[arg(long, default_value_t = 30)]
        max_checks: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("edgeward_server=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ServerConfig::load_and_resolve(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    match cli.command {
        Commands::Provision {
            admin,
            credential_hash,
            operator_ip,
            agreed,
        } => {
            operator_ip
                .parse::<std::net::IpAddr>()
                .with_context(|| format!("Invalid operator IP: {operator_ip}"))?;
            let store = open_store(&config).await?;
            store
                .provision_admin(admin, &credential_hash, &operator_ip)
                .await?;
            if agreed {
                store.set_agreement(admin, true).await?;
            }
            store.close().await;
            println!("Provisioned administrator {admin}");
        }
        Commands::Register {
            admin,
            domain,
            email,
            sse,
        } => {
            config.detect_proxy_host_ip().await?;
            let orchestrator = build_orchestrator(&config).await?;
            let stream = orchestrator.register_domain(admin, &domain, &email)?;
            report(stream, sse).await?;
        }
        Commands::Deregister { admin, sse } => {
            config.detect_proxy_host_ip().await?;
            let orchestrator = build_orchestrator(&config).await?;
            let stream = orchestrator.deregister_domain(admin)?;
            report(stream, sse).await?;
        }
        Commands::Status { admin } => {
            let orchestrator = build_orchestrator(&config).await?;
            let status = orchestrator.status(admin).await?;
            for line in status_lines(&status) {
                println!("{line}");
            }
        }
        Commands::EdgeConfig {
            operator_ip,
            caddyfile,
        } => {
            let policy = EdgePolicy::generate(&config.edge_policy_config(), &operator_ip)?;
            if caddyfile {
                print!("{}", policy.to_caddyfile());
            } else {
                println!("{}", policy.to_json_pretty()?);
            }
        }
        Commands::PrepareCerts {
            settle_secs,
            max_checks,
        } => {
            let archive = CertArchive::new(&config.storage_dir, &config.archive_dir);
            let report = tokio::task::spawn_blocking(move || {
                archive.prepare_deployment(Duration::from_secs(settle_secs), max_checks)
            })
            .await
            .context("Certificate archive task failed")??;

            match &report.restored {
                Some(path) => println!("Restored {}", path.display()),
                None => println!("No previous archive to restore"),
            }
            println!("Archived {}", report.archived.display());
            if !report.stable {
                println!("WARNING: certificate storage was still changing when archived");
            }
        }
    }

    Ok(())
}

async fn open_store(config: &ResolvedServerConfig) -> Result<SqliteDomainStore> {
    SqliteDomainStore::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))
}

/// Wire the orchestrator with the backend selected in configuration
async fn build_orchestrator(config: &ResolvedServerConfig) -> Result<Arc<DomainOrchestrator>> {
    let store: Arc<dyn DomainRecordStore> = Arc::new(open_store(config).await?);

    let client: Arc<dyn ProxyConfigClient> = if config.simulate {
        tracing::warn!("Using the SIMULATED control plane, nothing is provisioned");
        Arc::new(SimulatedProxyClient::new(config.simulation.clone()))
    } else {
        tracing::info!("Control plane: {}", config.control_plane.admin_url);
        Arc::new(CaddyClient::new(&config.caddy_client_config())?)
    };

    Ok(DomainOrchestrator::new(
        client,
        store,
        config.orchestrator_settings(),
    ))
}

/// Print progress until the terminal event, then fail the process if the operation failed
async fn report(mut stream: ProgressStream, sse: bool) -> Result<()> {
    if sse {
        let mut sink = FramedWrite::new(tokio::io::stdout(), SseCodec::new());
        while let Some(event) = stream.next_event().await {
            sink.send(event).await?;
        }
    } else {
        while let Some(event) = stream.next_event().await {
            let marker = match event.status {
                EventStatus::InProgress => "..",
                EventStatus::Success => "ok",
                EventStatus::Failure => "!!",
            };
            println!("[{}/5] {} {}", event.step, marker, event.message);
        }
    }

    let outcome = stream.outcome().await?;
    if !outcome.success {
        match outcome.status {
            Some(status) => anyhow::bail!(
                "Operation failed ({:?}), record status is {}",
                outcome.failure,
                status
            ),
            None => anyhow::bail!(
                "Operation failed ({:?}), record status unknown",
                outcome.failure
            ),
        }
    }
    Ok(())
}

/// Human-readable status report
///
/// The simulated control plane forgets everything when the process exits, so its live
/// state is not compared against the record.
fn status_lines(status: &DomainStatus) -> Vec<String> {
    let record = &status.record;
    let mut lines = vec![
        format!("Administrator: {}", record.admin_id),
        format!(
            "Domain:        {}",
            if record.has_domain() { record.domain_name.as_str() } else { "-" }
        ),
        format!("TLS status:    {}", record.tls_status),
        format!("Operator IP:   {}", record.operator_ip),
        format!(
            "Proxy host IP: {}",
            record.proxy_host_ip.as_deref().unwrap_or("-")
        ),
    ];

    if status.simulated {
        lines.push("Live:          unavailable (simulated control plane)".to_string());
        return lines;
    }

    lines.push(format!("Live:          {}", if status.is_live() { "yes" } else { "no" }));
    if !status.unowned_domains.is_empty() {
        lines.push(format!(
            "Unowned:       {}",
            status.unowned_domains.join(", ")
        ));
    }
    if status.diverged() {
        lines.push(
            "WARNING: record and control plane disagree; manual reconciliation required"
                .to_string(),
        );
    }
    lines
}

#[cfg(test)]
mod tests {
    use edgeward_protocol::TlsStatus;
    use edgeward_server::DomainRecord;

    use super::*;

    fn registered(simulated: bool) -> DomainStatus {
        DomainStatus {
            record: DomainRecord {
                admin_id: 1,
                domain_name: "shop.example.com".to_string(),
                email: "ops@example.com".to_string(),
                tls_status: TlsStatus::Https,
                proxy_host_ip: Some("198.51.100.1".to_string()),
                operator_ip: "203.0.113.1".to_string(),
            },
            // A fresh process: nothing applied yet
            live_domains: Vec::new(),
            unowned_domains: Vec::new(),
            simulated,
        }
    }

    #[test]
    fn test_simulated_status_reports_no_divergence() {
        let lines = status_lines(&registered(true));
        assert!(lines.iter().any(|l| l.contains("unavailable (simulated control plane)")));
        assert!(!lines.iter().any(|l| l.starts_with("WARNING")));
    }

    #[test]
    fn test_real_status_reports_divergence() {
        let lines = status_lines(&registered(false));
        assert!(lines.iter().any(|l| l == "Live:          no"));
        assert!(lines.iter().any(|l| l.starts_with("WARNING")));
    }
}
