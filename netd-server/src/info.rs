//! Endpoint identity records and registry snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// The two independent populations of connections a server manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnClass {
    /// Ordinary clients.
    Client,
    /// Cluster peers.
    Cluster,
}

impl ConnClass {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnClass::Client => "client",
            ConnClass::Cluster => "cluster",
        }
    }
}

impl fmt::Display for ConnClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity snapshot of one endpoint.
///
/// Built once for each listening socket (the server's identity) and once for
/// each accepted connection (the peer's identity). Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseInfo {
    /// Host as text (the configured host for listeners, the remote IP for peers).
    pub addr: String,
    pub ip: IpAddr,
    pub port: u16,
    pub server_id: String,
    pub version: String,
    pub build: String,
    pub max_payload: usize,
}

impl BaseInfo {
    /// Identity of a listening socket.
    pub fn server(local: SocketAddr, server_id: &str, max_payload: usize) -> Self {
        Self {
            addr: local.ip().to_string(),
            ip: local.ip(),
            port: local.port(),
            server_id: server_id.to_string(),
            version: crate::VERSION.to_string(),
            build: crate::BUILD.to_string(),
            max_payload,
        }
    }

    /// Identity of an accepted connection. Every peer gets a fresh id.
    pub fn peer(remote: SocketAddr, max_payload: usize) -> Self {
        Self {
            addr: remote.ip().to_string(),
            ip: remote.ip(),
            port: remote.port(),
            server_id: uuid::Uuid::new_v4().to_string(),
            version: crate::VERSION.to_string(),
            build: crate::BUILD.to_string(),
            max_payload,
        }
    }

    /// Returns the endpoint as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Flat JSON form used for logging and `INFO` style replies.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for BaseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

/// Point-in-time copy of a registry, in admission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchableInfo(Vec<BaseInfo>);

impl SearchableInfo {
    pub fn new(infos: Vec<BaseInfo>) -> Self {
        Self(infos)
    }

    /// All entries whose IP equals `ip`.
    pub fn by_ip(&self, ip: IpAddr) -> SearchableInfo {
        SearchableInfo(self.0.iter().filter(|i| i.ip == ip).cloned().collect())
    }

    /// First entry with the given address and port.
    pub fn by_addr_port(&self, addr: &str, port: u16) -> Option<&BaseInfo> {
        self.0.iter().find(|i| i.addr == addr && i.port == port)
    }

    /// Whether any entry has the given address and port.
    pub fn has_addr_port(&self, addr: &str, port: u16) -> bool {
        self.by_addr_port(addr, port).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BaseInfo> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<BaseInfo> {
        self.0
    }
}

impl IntoIterator for SearchableInfo {
    type Item = BaseInfo;
    type IntoIter = std::vec::IntoIter<BaseInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a SearchableInfo {
    type Item = &'a BaseInfo;
    type IntoIter = std::slice::Iter<'a, BaseInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
