//! Service identity resolution
//!
//! Precedence: explicit configuration, then an injected
//! `ServiceInfoProvider`, then platform introspection (entry program name,
//! local addressing). Identity is resolved once, before the agent is
//! constructed; the agent itself never mutates it.

use std::net::{IpAddr, UdpSocket};
use tracing::{debug, warn};

use services_common::MeshError;

use crate::config::AgentConfig;

/// Hosts that mean "all interfaces" and must be replaced with a routable
/// address before publishing
const WILDCARD_HOSTS: [&str; 4] = ["0.0.0.0", "::", "*", "+"];

/// The resolved (name, host, port) triple an agent publishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

/// Host-application hook supplying identity when configuration does not
pub trait ServiceInfoProvider: Send + Sync {
    fn service_name(&self) -> Option<String> {
        None
    }
    fn host(&self) -> Option<String> {
        None
    }
    fn port(&self) -> Option<u16> {
        None
    }
}

/// Resolve the identity to publish, field by field
pub fn resolve_identity(
    config: &AgentConfig,
    provider: Option<&dyn ServiceInfoProvider>,
) -> Result<ServiceIdentity, MeshError> {
    let service_name = config
        .service_name
        .clone()
        .or_else(|| provider.and_then(ServiceInfoProvider::service_name))
        .or_else(entry_program_name)
        .ok_or_else(|| MeshError::Validation("serviceName could not be resolved".to_string()))?;
    if service_name.trim().is_empty() {
        return Err(MeshError::Validation("serviceName must not be empty".to_string()));
    }

    let port = config
        .port
        .or_else(|| provider.and_then(ServiceInfoProvider::port))
        .ok_or_else(|| {
            MeshError::Validation(format!("no port configured for service '{service_name}'"))
        })?;
    if port == 0 {
        return Err(MeshError::Validation("port must be in [1, 65535]".to_string()));
    }

    let raw_host = config
        .host
        .clone()
        .or_else(|| provider.and_then(ServiceInfoProvider::host))
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let host = substitute_wildcard(&raw_host);

    debug!(service = %service_name, %host, port, "Resolved service identity");
    Ok(ServiceIdentity {
        service_name,
        host,
        port,
    })
}

/// Replace a wildcard bind address with the first non-loopback IPv4
#[must_use]
pub fn substitute_wildcard(host: &str) -> String {
    if !WILDCARD_HOSTS.contains(&host) {
        return host.to_string();
    }
    match local_ipv4() {
        Some(addr) => addr,
        None => {
            warn!(%host, "No non-loopback IPv4 found, publishing loopback");
            "127.0.0.1".to_string()
        }
    }
}

/// Executable file stem, the platform fallback for the service name
fn entry_program_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}

/// First non-loopback IPv4 from host networking, discovered by asking
/// the OS which source address it would route outward from. No packet is
/// sent; the socket is never written to.
fn local_ipv4() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("198.51.100.1:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(addr) if !addr.is_loopback() && !addr.is_unspecified() => {
            Some(addr.to_string())
        }
        _ => None,
    }
}
