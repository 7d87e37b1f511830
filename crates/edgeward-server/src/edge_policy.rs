//! Static edge policy for the control plane
//!
//! The edge policy pins the control plane's admin API to loopback and only lets the
//! operator's home IP plus a fixed set of partner ranges reach the protected
//! application. Everything else receives a fixed 403.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

use crate::caddy_config::{CaddyConfig, RouteSettings, DENY_BODY, DENY_STATUS};

/// Webhook callers that must always reach the application
pub const DEFAULT_PARTNER_RANGES: [&str; 4] = [
    "52.89.214.238/32",
    "34.212.75.30/32",
    "54.218.53.128/32",
    "52.32.178.7/32",
];

/// Default admin API bind address
pub const DEFAULT_ADMIN_LISTEN: &str = "127.0.0.1:2019";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid IP range '{0}'")]
    InvalidRange(String),

    #[error("Admin API must bind to a loopback address, got {0}")]
    AdminNotLoopback(SocketAddr),

    #[error("Failed to render policy: {0}")]
    Render(#[from] serde_json::Error),
}

/// An address block in CIDR notation; a bare address is a single-host block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    network: IpAddr,
    prefix: u8,
}

impl IpRange {
    pub fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self {
            network: addr,
            prefix,
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpRange {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || PolicyError::InvalidRange(s.to_string());

        let Some((addr, prefix)) = s.split_once('/') else {
            return s.parse().map(Self::host).map_err(|_| invalid());
        };

        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Ordered set of ranges allowed through the edge; the operator's address comes first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowlist {
    ranges: Vec<IpRange>,
}

impl Allowlist {
    pub fn new(operator_ip: &str, partner_ranges: &[String]) -> Result<Self, PolicyError> {
        let operator: IpAddr = operator_ip
            .trim()
            .parse()
            .map_err(|_| PolicyError::InvalidRange(operator_ip.to_string()))?;

        let mut ranges = vec![IpRange::host(operator)];
        for raw in partner_ranges {
            let range: IpRange = raw.parse()?;
            if !ranges.contains(&range) {
                ranges.push(range);
            }
        }

        Ok(Self { ranges })
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    pub fn permits(&self, addr: IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(addr))
    }
}

/// Inputs for generating the edge policy
#[derive(Debug, Clone)]
pub struct EdgePolicyConfig {
    pub admin_listen: SocketAddr,
    pub route: RouteSettings,
    pub partner_ranges: Vec<String>,
}

impl Default for EdgePolicyConfig {
    fn default() -> Self {
        Self {
            admin_listen: SocketAddr::from(([127, 0, 0, 1], 2019)),
            route: RouteSettings::default(),
            partner_ranges: DEFAULT_PARTNER_RANGES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Generated edge policy for one operator
#[derive(Debug, Clone)]
pub struct EdgePolicy {
    admin_listen: SocketAddr,
    route: RouteSettings,
    allowlist: Allowlist,
}

impl EdgePolicy {
    pub fn generate(config: &EdgePolicyConfig, operator_ip: &str) -> Result<Self, PolicyError> {
        if !config.admin_listen.ip().is_loopback() {
            return Err(PolicyError::AdminNotLoopback(config.admin_listen));
        }

        let allowlist = Allowlist::new(operator_ip, &config.partner_ranges)?;
        tracing::debug!(
            ranges = allowlist.ranges().len(),
            admin = %config.admin_listen,
            "Generated edge policy"
        );

        Ok(Self {
            admin_listen: config.admin_listen,
            route: config.route.clone(),
            allowlist,
        })
    }

    /// Whether a caller at `addr` reaches the application
    pub fn permits(&self, addr: IpAddr) -> bool {
        self.allowlist.permits(addr)
    }

    /// JSON document suitable for the control plane's `/load` endpoint
    pub fn to_caddy_config(&self) -> CaddyConfig {
        CaddyConfig::allowlist_only(&self.route, &self.allowlist).with_admin_listen(self.admin_listen)
    }

    pub fn to_json_pretty(&self) -> Result<String, PolicyError> {
        Ok(serde_json::to_string_pretty(&self.to_caddy_config())?)
    }

    /// Caddyfile rendering of the same policy
    pub fn to_caddyfile(&self) -> String {
        let ranges = self
            .allowlist
            .ranges()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");

        format!(
            "{{\n\tadmin {admin}\n}}\n\n\
             :80 {{\n\
             \t@allowed {{\n\t\tremote_ip {ranges}\n\t}}\n\n\
             \thandle @allowed {{\n\t\treverse_proxy {upstream}\n\t}}\n\n\
             \thandle {{\n\t\trespond \"{body}\" {status}\n\t}}\n\
             }}\n",
            admin = self.admin_listen,
            upstream = self.route.upstream,
            body = DENY_BODY,
            status = DENY_STATUS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_parsing() {
        let single: IpRange = "10.1.2.3".parse().unwrap();
        assert_eq!(single.to_string(), "10.1.2.3/32");

        let block: IpRange = "10.0.0.0/8".parse().unwrap();
        assert!(block.contains("10.200.1.1".parse().unwrap()));
        assert!(!block.contains("11.0.0.1".parse().unwrap()));
        assert!(!block.contains("::1".parse().unwrap()));

        let any: IpRange = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains("8.8.8.8".parse().unwrap()));

        let v6: IpRange = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains("2001:db8::1".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<IpRange>().is_err());
        assert!("not-an-ip".parse::<IpRange>().is_err());
        assert!("10.0.0.0/x".parse::<IpRange>().is_err());
    }

    #[test]
    fn test_allowlist_puts_operator_first_and_dedups() {
        let allowlist = Allowlist::new(
            "198.51.100.4",
            &["198.51.100.4/32".to_string(), "52.89.214.238".to_string()],
        )
        .unwrap();
        let ranges: Vec<String> = allowlist.ranges().iter().map(ToString::to_string).collect();
        assert_eq!(ranges, vec!["198.51.100.4/32", "52.89.214.238/32"]);
        assert!(Allowlist::new("nope", &[]).is_err());
    }

    #[test]
    fn test_policy_permits_only_allowlisted_callers() {
        let policy = EdgePolicy::generate(&EdgePolicyConfig::default(), "198.51.100.4").unwrap();
        assert!(policy.permits("198.51.100.4".parse().unwrap()));
        assert!(policy.permits("34.212.75.30".parse().unwrap()));
        assert!(!policy.permits("198.51.100.5".parse().unwrap()));
        assert_eq!(policy.to_caddy_config().apps.http.unwrap().servers["srv0"].routes.len(), 2);
    }

    #[test]
    fn test_rejects_public_admin_bind() {
        let config = EdgePolicyConfig {
            admin_listen: "0.0.0.0:2019".parse().unwrap(),
            ..Default::default()
        };
        assert!(matches!(
            EdgePolicy::generate(&config, "198.51.100.4"),
            Err(PolicyError::AdminNotLoopback(_))
        ));
    }

    #[test]
    fn test_json_document_binds_admin_to_loopback() {
        let policy = EdgePolicy::generate(&EdgePolicyConfig::default(), "198.51.100.4").unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&policy.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["admin"]["listen"], "127.0.0.1:2019");
        assert!(json["apps"].get("tls").is_none());
        assert_eq!(
            json["apps"]["http"]["servers"]["srv0"]["routes"][1]["handle"][0]["body"],
            "Access Denied"
        );
    }

    #[test]
    fn test_caddyfile_rendering() {
        let policy = EdgePolicy::generate(&EdgePolicyConfig::default(), "198.51.100.4").unwrap();
        let caddyfile = policy.to_caddyfile();
        assert!(caddyfile.starts_with("{\n\tadmin 127.0.0.1:2019\n}\n"));
        assert!(caddyfile.contains("remote_ip 198.51.100.4/32 52.89.214.238/32"));
        assert!(caddyfile.contains("reverse_proxy 127.0.0.1:8000"));
        assert!(caddyfile.contains("respond \"Access Denied\" 403"));
    }
}
