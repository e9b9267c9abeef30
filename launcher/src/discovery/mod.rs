//! Service discovery and route table construction
//!
//! After a successful deploy this module resolves where the workload's
//! backend services actually live. Each routed service is checked against
//! the live platform (an optional introspection command, then a bounded TCP
//! probe); anything unreachable degrades to the configured fallback backend
//! so the resulting table never contains an empty entry. The table is
//! rebuilt wholesale on every cycle, never patched in place.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::LauncherError;
use crate::profile::{CommandSpec, DeploymentProfile, ServiceSpec};

/// A service link after variable substitution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedService {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

/// One routing rule: path pattern to backend address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Service name the rule belongs to
    pub name: String,

    /// Path prefix pattern
    pub pattern: String,

    /// Backend address (host:port)
    pub backend: String,
}

/// Ordered path-pattern to backend mapping plus the designated fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTable {
    pub routes: Vec<Route>,
    pub fallback: String,
}

/// Discovery options
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Endpoint answering with this host's public address
    pub address_endpoint: String,

    /// Timeout for the public-address call
    pub http_timeout: Duration,

    /// Timeout for each backend TCP probe
    pub probe_timeout: Duration,

    /// Timeout for each introspection command
    pub lookup_timeout: Duration,

    /// Backend receiving traffic for unreachable services and unmatched
    /// paths
    pub fallback_backend: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            address_endpoint: "https://icanhazip.com".to_string(),
            http_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            lookup_timeout: Duration::from_secs(10),
            fallback_backend: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Resolve this host's public address via the configured endpoint
pub async fn public_address(options: &DiscoveryOptions) -> Result<String, LauncherError> {
    let client = reqwest::Client::builder()
        .timeout(options.http_timeout)
        .build()?;

    let body = client
        .get(&options.address_endpoint)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| LauncherError::DiscoveryUnavailable(format!("address lookup failed: {}", e)))?
        .text()
        .await
        .map_err(|e| LauncherError::DiscoveryUnavailable(format!("address lookup failed: {}", e)))?;

    let address = body.trim().to_string();
    address.parse::<std::net::IpAddr>().map_err(|_| {
        LauncherError::DiscoveryUnavailable(format!(
            "address lookup returned a non-address: {:?}",
            address
        ))
    })?;

    debug!("Resolved public address: {}", address);
    Ok(address)
}

/// Derive the domain suffix from an inbound Host header by stripping the
/// profile's prefix token.
///
/// Host `studio-abc123.example.com` with prefix `studio` yields
/// `-abc123.example.com`.
pub fn base_domain(host_header: &str, prefix: &str) -> Option<String> {
    let host = host_header.split(':').next().unwrap_or("");
    if prefix.is_empty() || host.is_empty() {
        return None;
    }

    let suffix = host.strip_prefix(prefix)?;
    if suffix.starts_with('-') && suffix.contains('.') {
        Some(suffix.to_string())
    } else {
        None
    }
}

/// Substitute the runtime variables into every service link template.
///
/// Only the two declared placeholders are ever substituted; an unavailable
/// variable leaves its placeholder untouched rather than guessing.
pub fn resolve_links(
    profile: &DeploymentProfile,
    host_ip: Option<&str>,
    base_domain: Option<&str>,
) -> Vec<ResolvedService> {
    profile
        .services
        .iter()
        .map(|service| {
            let mut url = service.url.clone();
            if let Some(ip) = host_ip {
                url = url.replace("${HOST_IP}", ip);
            }
            if let Some(domain) = base_domain {
                url = url.replace("${BASE_DOMAIN}", domain);
            }
            ResolvedService {
                name: service.name.clone(),
                url,
                description: service.description.clone(),
            }
        })
        .collect()
}

/// Check whether a backend address currently accepts connections
pub async fn probe_backend(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

async fn lookup_address(lookup: &CommandSpec, timeout: Duration) -> Option<String> {
    let output = Command::new(lookup.program())
        .args(lookup.args())
        .stdin(Stdio::null())
        .output();

    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) if output.status.success() => {
            let addr = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if addr.is_empty() {
                None
            } else {
                Some(addr)
            }
        }
        _ => None,
    }
}

async fn resolve_backend(service: &ServiceSpec, options: &DiscoveryOptions) -> (String, bool) {
    let candidate = match &service.lookup {
        Some(lookup) => lookup_address(lookup, options.lookup_timeout)
            .await
            .or_else(|| service.upstream.clone()),
        None => service.upstream.clone(),
    };

    match candidate {
        Some(addr) if probe_backend(&addr, options.probe_timeout).await => (addr, false),
        Some(addr) => {
            warn!(
                "Backend {} for service {} is unreachable, degrading to fallback",
                addr, service.name
            );
            (options.fallback_backend.clone(), true)
        }
        None => {
            warn!(
                "No backend resolved for service {}, degrading to fallback",
                service.name
            );
            (options.fallback_backend.clone(), true)
        }
    }
}

/// Build a fresh route table for the profile.
///
/// Returns the table plus a degraded flag set when any entry fell back.
/// The table always carries one route per declared routed service, in
/// declaration order.
pub async fn build_route_table(
    profile: &DeploymentProfile,
    options: &DiscoveryOptions,
) -> (RouteTable, bool) {
    let mut routes = Vec::new();
    let mut degraded = false;

    for service in profile.routed_services() {
        let (backend, fell_back) = resolve_backend(service, options).await;
        degraded |= fell_back;
        routes.push(Route {
            name: service.name.clone(),
            pattern: service.path.clone().unwrap_or_default(),
            backend,
        });
    }

    (
        RouteTable {
            routes,
            fallback: options.fallback_backend.clone(),
        },
        degraded,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ServiceSpec;

    fn profile_with_services(services: Vec<ServiceSpec>) -> DeploymentProfile {
        DeploymentProfile {
            id: "test".to_string(),
            description: String::new(),
            heading: String::new(),
            working_dir: ".".to_string(),
            host_prefix: "studio".to_string(),
            versions: vec![],
            default_version: String::new(),
            pre_commands: vec![],
            command: CommandSpec::new(["true"]),
            uninstall_commands: vec![],
            input_fields: vec![],
            services,
        }
    }

    #[test]
    fn test_base_domain_strips_prefix() {
        assert_eq!(
            base_domain("studio-abc123.example.com", "studio"),
            Some("-abc123.example.com".to_string())
        );
        assert_eq!(
            base_domain("studio-abc123.example.com:8443", "studio"),
            Some("-abc123.example.com".to_string())
        );
    }

    #[test]
    fn test_base_domain_rejects_non_matching_hosts() {
        assert_eq!(base_domain("dashboard.example.com", "studio"), None);
        assert_eq!(base_domain("studio.example.com", "studio"), None);
        assert_eq!(base_domain("localhost", "studio"), None);
        assert_eq!(base_domain("studio-abc123.example.com", ""), None);
    }

    #[test]
    fn test_resolve_links_substitutes_declared_placeholders() {
        let profile = profile_with_services(vec![
            ServiceSpec {
                name: "dash".to_string(),
                description: String::new(),
                url: "https://dash${BASE_DOMAIN}".to_string(),
                path: None,
                upstream: None,
                lookup: None,
            },
            ServiceSpec {
                name: "api".to_string(),
                description: String::new(),
                url: "http://${HOST_IP}:9000".to_string(),
                path: None,
                upstream: None,
                lookup: None,
            },
        ]);

        let links = resolve_links(&profile, Some("203.0.113.7"), Some("-abc123.example.com"));
        assert_eq!(links[0].url, "https://dash-abc123.example.com");
        assert_eq!(links[1].url, "http://203.0.113.7:9000");
    }

    #[test]
    fn test_resolve_links_leaves_unavailable_placeholders() {
        let profile = profile_with_services(vec![ServiceSpec {
            name: "dash".to_string(),
            description: String::new(),
            url: "https://dash${BASE_DOMAIN}".to_string(),
            path: None,
            upstream: None,
            lookup: None,
        }]);

        let links = resolve_links(&profile, None, None);
        assert_eq!(links[0].url, "https://dash${BASE_DOMAIN}");
    }
}
