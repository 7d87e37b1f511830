//! Typed subset of the Caddy JSON configuration used by edgeward
//!
//! Only the pieces edgeward writes are modelled: one HTTP server with a route per exposed
//! domain, an allowlist route and a deny-all fallback, plus a TLS automation policy per
//! exposed domain. Unknown fields in documents read back from Caddy are ignored.
//!
//! Several administrators share one control plane, so a domain's pieces are folded into
//! the live document (`merge_exposure`) or cut out of it (`remove_domain`) rather than
//! replacing it wholesale.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::edge_policy::Allowlist;

/// Listen addresses when a domain is exposed over HTTPS
const HTTPS_LISTEN: [&str; 2] = [":80", ":443"];

/// Listen addresses for the allowlist-only configuration
const HTTP_LISTEN: [&str; 1] = [":80"];

/// Body returned to callers outside the allowlist
pub const DENY_BODY: &str = "Access Denied";

/// Status returned to callers outside the allowlist
pub const DENY_STATUS: u16 = 403;

/// Where the proxied application lives and which Caddy server block edgeward owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    /// Caddy HTTP server id (e.g. "srv0")
    pub server_id: String,
    /// Upstream dial address of the protected application (e.g. "127.0.0.1:8000")
    pub upstream: String,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            server_id: "srv0".to_string(),
            upstream: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaddyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,
    #[serde(default)]
    pub apps: Apps,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Apps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpApp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsApp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpApp {
    #[serde(default)]
    pub servers: BTreeMap<String, HttpServer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpServer {
    #[serde(default)]
    pub listen: Vec<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<Matcher>,
    #[serde(default)]
    pub handle: Vec<Handler>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Matcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<RemoteIpMatcher>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteIpMatcher {
    pub ranges: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum Handler {
    ReverseProxy { upstreams: Vec<Upstream> },
    StaticResponse { status_code: u16, body: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    pub dial: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsApp {
    #[serde(default)]
    pub automation: TlsAutomation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsAutomation {
    #[serde(default)]
    pub policies: Vec<TlsPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsPolicy {
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issuers: Vec<Issuer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issuer {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Stable `@id` of the route that serves an exposed domain
pub fn route_id(domain: &str) -> String {
    format!("domain_route_{}", domain.replace(['.', '-'], "_"))
}

fn reverse_proxy(upstream: &str) -> Vec<Handler> {
    vec![Handler::ReverseProxy {
        upstreams: vec![Upstream {
            dial: upstream.to_string(),
        }],
    }]
}

fn allowlist_route(settings: &RouteSettings, allowlist: &Allowlist) -> Route {
    Route {
        id: Some("ip_allowlist".to_string()),
        matchers: vec![Matcher {
            remote_ip: Some(RemoteIpMatcher {
                ranges: allowlist.ranges().iter().map(ToString::to_string).collect(),
            }),
            ..Default::default()
        }],
        handle: reverse_proxy(&settings.upstream),
        terminal: true,
    }
}

fn deny_route() -> Route {
    Route {
        handle: vec![Handler::StaticResponse {
            status_code: DENY_STATUS,
            body: DENY_BODY.to_string(),
        }],
        ..Default::default()
    }
}

fn single_server(settings: &RouteSettings, server: HttpServer) -> HttpApp {
    let mut servers = BTreeMap::new();
    servers.insert(settings.server_id.clone(), server);
    HttpApp { servers }
}

impl HttpServer {
    fn merge(&mut self, other: &HttpServer) {
        for addr in &other.listen {
            if !self.listen.contains(addr) {
                self.listen.push(addr.clone());
            }
        }
        for route in &other.routes {
            self.merge_route(route);
        }
    }

    /// Host routes stay ahead of the rest, and the catch-all deny stays last
    fn merge_route(&mut self, incoming: &Route) {
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|route| route.id.is_some() && route.id == incoming.id)
        {
            if !existing.union_ranges(incoming) {
                *existing = incoming.clone();
            }
            return;
        }

        if self.routes.contains(incoming) {
            return;
        }

        let position = if incoming.matches_host() {
            self.routes.iter().position(|route| !route.matches_host())
        } else {
            self.routes.iter().position(|route| route.matchers.is_empty())
        };
        self.routes
            .insert(position.unwrap_or(self.routes.len()), incoming.clone());
    }
}

impl Route {
    fn matches_host(&self) -> bool {
        self.matchers.iter().any(|matcher| matcher.host.is_some())
    }

    /// Add the other route's remote-IP ranges to this one; false if either has none
    fn union_ranges(&mut self, other: &Route) -> bool {
        let incoming: Vec<&String> = other
            .matchers
            .iter()
            .filter_map(|matcher| matcher.remote_ip.as_ref())
            .flat_map(|remote| remote.ranges.iter())
            .collect();
        let Some(target) = self
            .matchers
            .iter_mut()
            .find_map(|matcher| matcher.remote_ip.as_mut())
        else {
            return false;
        };
        if incoming.is_empty() {
            return false;
        }

        for range in incoming {
            if !target.ranges.contains(range) {
                target.ranges.push(range.clone());
            }
        }
        true
    }
}

impl CaddyConfig {
    /// Configuration exposing `domain` over HTTPS with automatic ACME issuance
    ///
    /// Route order matters: the domain route matches first, then the allowlist, then
    /// everything else is denied.
    pub fn domain_exposure(
        domain: &str,
        email: &str,
        settings: &RouteSettings,
        allowlist: &Allowlist,
    ) -> Self {
        let domain_route = Route {
            id: Some(route_id(domain)),
            matchers: vec![Matcher {
                host: Some(vec![domain.to_string()]),
                ..Default::default()
            }],
            handle: reverse_proxy(&settings.upstream),
            terminal: true,
        };

        let server = HttpServer {
            listen: HTTPS_LISTEN.iter().map(|s| s.to_string()).collect(),
            routes: vec![domain_route, allowlist_route(settings, allowlist), deny_route()],
        };

        let issuer = Issuer {
            module: "acme".to_string(),
            email: (!email.is_empty()).then(|| email.to_string()),
        };

        Self {
            admin: None,
            apps: Apps {
                http: Some(single_server(settings, server)),
                tls: Some(TlsApp {
                    automation: TlsAutomation {
                        policies: vec![TlsPolicy {
                            subjects: vec![domain.to_string()],
                            issuers: vec![issuer],
                        }],
                    },
                }),
            },
        }
    }

    /// Plain-HTTP configuration that only serves allowlisted callers
    pub fn allowlist_only(settings: &RouteSettings, allowlist: &Allowlist) -> Self {
        let server = HttpServer {
            listen: HTTP_LISTEN.iter().map(|s| s.to_string()).collect(),
            routes: vec![allowlist_route(settings, allowlist), deny_route()],
        };

        Self {
            admin: None,
            apps: Apps {
                http: Some(single_server(settings, server)),
                tls: None,
            },
        }
    }

    /// Pin the admin API to the given address
    pub fn with_admin_listen(mut self, addr: SocketAddr) -> Self {
        self.admin = Some(AdminConfig {
            listen: addr.to_string(),
        });
        self
    }

    /// Fold one domain's exposure into this document, leaving other domains untouched
    ///
    /// The domain route replaces any route with the same `@id`, allowlist ranges are
    /// unioned, and the domain's TLS policy replaces any earlier policy naming it.
    pub fn merge_exposure(&mut self, domain: &str, exposure: &CaddyConfig) {
        self.drop_tls_subject(domain);
        self.merge(exposure);
    }

    /// Cut one domain's route and TLS policy out, then fold in the allowlist-only `fallback`
    ///
    /// A server left without any host route goes back to the fallback's listeners.
    pub fn remove_domain(&mut self, domain: &str, fallback: &CaddyConfig) {
        let id = route_id(domain);
        if let Some(http) = self.apps.http.as_mut() {
            for server in http.servers.values_mut() {
                server.routes.retain(|route| route.id.as_deref() != Some(id.as_str()));
            }
        }
        self.drop_tls_subject(domain);
        self.merge(fallback);

        let (Some(http), Some(incoming)) = (self.apps.http.as_mut(), fallback.apps.http.as_ref())
        else {
            return;
        };
        for (id, fallback_server) in &incoming.servers {
            if let Some(server) = http.servers.get_mut(id) {
                if !server.routes.iter().any(Route::matches_host) {
                    server.listen = fallback_server.listen.clone();
                }
            }
        }
    }

    fn drop_tls_subject(&mut self, domain: &str) {
        let Some(tls) = self.apps.tls.as_mut() else {
            return;
        };

        // Policies emptied by the removal go away; catch-all policies stay
        tls.automation.policies.retain_mut(|policy| {
            let before = policy.subjects.len();
            policy.subjects.retain(|subject| subject != domain);
            policy.subjects.len() == before || !policy.subjects.is_empty()
        });
        if tls.automation.policies.is_empty() {
            self.apps.tls = None;
        }
    }

    fn merge(&mut self, other: &CaddyConfig) {
        if let Some(incoming) = &other.apps.http {
            let http = self.apps.http.get_or_insert_with(HttpApp::default);
            for (id, server) in &incoming.servers {
                http.servers.entry(id.clone()).or_default().merge(server);
            }
        }

        if let Some(incoming) = &other.apps.tls {
            self.apps
                .tls
                .get_or_insert_with(TlsApp::default)
                .automation
                .policies
                .extend(incoming.automation.policies.iter().cloned());
        }
    }

    /// Domains covered by a TLS automation policy
    pub fn tls_subjects(&self) -> Vec<&str> {
        self.apps
            .tls
            .iter()
            .flat_map(|tls| tls.automation.policies.iter())
            .flat_map(|policy| policy.subjects.iter())
            .map(String::as_str)
            .collect()
    }

    /// Hostnames matched by any route of any server
    pub fn routed_hosts(&self) -> Vec<&str> {
        self.apps
            .http
            .iter()
            .flat_map(|http| http.servers.values())
            .flat_map(|server| server.routes.iter())
            .flat_map(|route| route.matchers.iter())
            .filter_map(|matcher| matcher.host.as_ref())
            .flat_map(|hosts| hosts.iter())
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> Allowlist {
        Allowlist::new("203.0.113.7", &["52.89.214.238".to_string()]).unwrap()
    }

    #[test]
    fn test_route_id() {
        assert_eq!(route_id("test.example.com"), "domain_route_test_example_com");
        assert_eq!(route_id("my-site.io"), "domain_route_my_site_io");
    }

    #[test]
    fn test_domain_exposure_document() {
        let config = CaddyConfig::domain_exposure(
            "test.example.com",
            "ops@example.com",
            &RouteSettings::default(),
            &allowlist(),
        );
        let json = serde_json::to_value(&config).unwrap();

        let server = &json["apps"]["http"]["servers"]["srv0"];
        assert_eq!(server["listen"], serde_json::json!([":80", ":443"]));

        let routes = server["routes"].as_array().unwrap();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0]["@id"], "domain_route_test_example_com");
        assert_eq!(routes[0]["match"][0]["host"][0], "test.example.com");
        assert_eq!(routes[0]["handle"][0]["handler"], "reverse_proxy");
        assert_eq!(routes[0]["handle"][0]["upstreams"][0]["dial"], "127.0.0.1:8000");
        assert_eq!(routes[0]["terminal"], true);
        assert_eq!(
            routes[1]["match"][0]["remote_ip"]["ranges"],
            serde_json::json!(["203.0.113.7/32", "52.89.214.238/32"])
        );
        assert_eq!(routes[2]["handle"][0]["handler"], "static_response");
        assert_eq!(routes[2]["handle"][0]["status_code"], 403);
        assert!(routes[2].get("terminal").is_none());

        let policy = &json["apps"]["tls"]["automation"]["policies"][0];
        assert_eq!(policy["subjects"][0], "test.example.com");
        assert_eq!(policy["issuers"][0]["module"], "acme");
        assert_eq!(policy["issuers"][0]["email"], "ops@example.com");
        assert!(json.get("admin").is_none());
    }

    #[test]
    fn test_allowlist_only_has_no_tls() {
        let config = CaddyConfig::allowlist_only(&RouteSettings::default(), &allowlist());
        assert!(config.tls_subjects().is_empty());
        assert!(config.routed_hosts().is_empty());

        let server = &config.apps.http.as_ref().unwrap().servers["srv0"];
        assert_eq!(server.listen, vec![":80".to_string()]);
        assert_eq!(server.routes.len(), 2);
    }

    #[test]
    fn test_parses_foreign_handlers() {
        let raw = r#"{
            "apps": {
                "http": {"servers": {"srv0": {"listen": [":443"], "routes": [
                    {"match": [{"host": ["a.example.com"]}],
                     "handle": [{"handler": "file_server", "root": "/srv"}]}
                ]}}},
                "tls": {"automation": {"policies": [{"subjects": ["a.example.com"]}]}}
            }
        }"#;
        let config: CaddyConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.routed_hosts(), vec!["a.example.com"]);
        assert_eq!(config.tls_subjects(), vec!["a.example.com"]);
        assert_eq!(
            config.apps.http.unwrap().servers["srv0"].routes[0].handle[0],
            Handler::Other
        );
    }

    fn operator(ip: &str) -> Allowlist {
        Allowlist::new(ip, &["52.89.214.238".to_string()]).unwrap()
    }

    fn exposure(domain: &str, ip: &str) -> CaddyConfig {
        CaddyConfig::domain_exposure(domain, "ops@example.com", &RouteSettings::default(), &operator(ip))
    }

    fn route_ids(config: &CaddyConfig) -> Vec<Option<&str>> {
        config.apps.http.as_ref().unwrap().servers["srv0"]
            .routes
            .iter()
            .map(|route| route.id.as_deref())
            .collect()
    }

    fn ranges(config: &CaddyConfig) -> Vec<String> {
        let server = &config.apps.http.as_ref().unwrap().servers["srv0"];
        let allowlist = server
            .routes
            .iter()
            .find(|route| route.id.as_deref() == Some("ip_allowlist"))
            .unwrap();
        allowlist.matchers[0].remote_ip.as_ref().unwrap().ranges.clone()
    }

    #[test]
    fn test_merge_into_empty_document() {
        let mut live = CaddyConfig::default();
        live.merge_exposure("one.example.com", &exposure("one.example.com", "203.0.113.1"));
        assert_eq!(live, exposure("one.example.com", "203.0.113.1"));
    }

    #[test]
    fn test_merge_keeps_other_domains() {
        let mut live = exposure("one.example.com", "203.0.113.1");
        live.merge_exposure("two.example.com", &exposure("two.example.com", "203.0.113.2"));

        assert_eq!(
            route_ids(&live),
            vec![
                Some("domain_route_one_example_com"),
                Some("domain_route_two_example_com"),
                Some("ip_allowlist"),
                None,
            ]
        );
        assert_eq!(
            ranges(&live),
            vec!["203.0.113.1/32", "52.89.214.238/32", "203.0.113.2/32"]
        );
        assert_eq!(live.tls_subjects(), vec!["one.example.com", "two.example.com"]);

        // Re-applying the same domain does not duplicate anything
        let snapshot = live.clone();
        live.merge_exposure("two.example.com", &exposure("two.example.com", "203.0.113.2"));
        assert_eq!(live, snapshot);
    }

    #[test]
    fn test_remove_domain_keeps_the_rest() {
        let mut live = exposure("one.example.com", "203.0.113.1");
        live.merge_exposure("two.example.com", &exposure("two.example.com", "203.0.113.2"));

        let fallback = CaddyConfig::allowlist_only(&RouteSettings::default(), &operator("203.0.113.1"));
        live.remove_domain("one.example.com", &fallback);

        assert_eq!(
            route_ids(&live),
            vec![Some("domain_route_two_example_com"), Some("ip_allowlist"), None]
        );
        assert_eq!(live.tls_subjects(), vec!["two.example.com"]);
        assert_eq!(live.routed_hosts(), vec!["two.example.com"]);
        assert!(ranges(&live).contains(&"203.0.113.1/32".to_string()));
        assert_eq!(
            live.apps.http.as_ref().unwrap().servers["srv0"].listen,
            vec![":80".to_string(), ":443".to_string()]
        );

        // Removing the last domain leaves the plain-HTTP allowlist document
        live.remove_domain("two.example.com", &fallback);
        assert!(live.apps.tls.is_none());
        assert_eq!(route_ids(&live), vec![Some("ip_allowlist"), None]);
        assert_eq!(
            live.apps.http.as_ref().unwrap().servers["srv0"].listen,
            vec![":80".to_string()]
        );
    }

    #[test]
    fn test_remove_keeps_catch_all_tls_policy() {
        let mut live = exposure("one.example.com", "203.0.113.1");
        live.apps.tls.as_mut().unwrap().automation.policies.push(TlsPolicy {
            subjects: Vec::new(),
            issuers: vec![Issuer {
                module: "internal".to_string(),
                email: None,
            }],
        });

        let fallback = CaddyConfig::allowlist_only(&RouteSettings::default(), &allowlist());
        live.remove_domain("one.example.com", &fallback);

        let policies = &live.apps.tls.as_ref().unwrap().automation.policies;
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].issuers[0].module, "internal");
    }
}
