//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via NETD_CONFIG)
//! 3. Environment variables

use crate::info::ConnClass;
use crate::tls::TlsContext;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub network: NetworkConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Payload and timing limits.
    pub limits: LimitsConfig,
    /// Broadcast policy.
    pub broadcast: BroadcastConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
    /// TLS acceptor, resolved at most once from `tls`.
    #[serde(skip)]
    pub(crate) tls_context: TlsContext,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("NETD_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.limits.apply_env_overrides();
        self.broadcast.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads credentials from the external credentials file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Checks the configuration for contradictions.
    ///
    /// TLS paths are not checked once an acceptor was installed with
    /// [`Config::install_tls_acceptor`]. Whether authentication has a
    /// credential source is checked per class when a listener starts, since
    /// authenticators are supplied to the server builder.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        if !self.tls_context.is_resolved() {
            self.tls.validate()?;
        }
        self.limits.validate()?;
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Returns the listen address for a connection class.
    pub fn listen_addr(&self, class: ConnClass) -> SocketAddr {
        match class {
            ConnClass::Client => self.network.client_addr,
            ConnClass::Cluster => self.network.cluster_addr,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.to_lowercase() == "true")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the client listener binds to.
    #[serde(with = "socket_addr_serde")]
    pub client_addr: SocketAddr,
    /// Address the cluster listener binds to.
    #[serde(with = "socket_addr_serde")]
    pub cluster_addr: SocketAddr,
    /// TLS handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,
    /// How long shutdown waits for providers to report closure, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            client_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, crate::DEFAULT_CLIENT_PORT)),
            cluster_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, crate::DEFAULT_CLUSTER_PORT)),
            handshake_timeout_ms: crate::TLS_TIMEOUT.as_millis() as u64,
            shutdown_grace_secs: 5,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse("NETD_CLIENT_ADDR") {
            self.client_addr = addr;
        }
        if let Some(addr) = env_parse("NETD_CLUSTER_ADDR") {
            self.cluster_addr = addr;
        }
        if let Some(ms) = env_parse("NETD_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = ms;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.client_addr.port() != 0 && self.client_addr == self.cluster_addr {
            return Err(ConfigError::ValidationError(format!(
                "client and cluster listeners share {}",
                self.client_addr
            )));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "handshake_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the TLS handshake deadline as Duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Returns the shutdown grace period as Duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// User authentication credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Exact-match lookup; first match wins.
pub fn match_credentials(list: &[Credential], candidate: &Credential) -> bool {
    list.iter()
        .any(|c| c.username == candidate.username && c.password == candidate.password)
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether new connections are authenticated at all.
    pub enabled: bool,
    /// Whether providers without credentials are turned away.
    pub required: bool,
    /// Static credentials accepted on the client listener.
    pub client_credentials: Vec<Credential>,
    /// Static credentials accepted on the cluster listener.
    pub cluster_credentials: Vec<Credential>,
    /// Optional YAML file with `clients:` and `clusters:` credential lists.
    pub credentials_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CredentialsFile {
    clients: Vec<Credential>,
    clusters: Vec<Credential>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("NETD_AUTH_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(required) = env_flag("NETD_AUTH_REQUIRED") {
            self.required = required;
        }
        if let Ok(path) = std::env::var("NETD_AUTH_CREDENTIALS_FILE") {
            self.credentials_file = Some(PathBuf::from(path));
        }
    }

    /// Appends credentials from the credentials file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.credentials_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            let file: CredentialsFile = serde_yaml::from_str(&content)
                .map_err(|e| ConfigError::ParseError(path.clone(), e.to_string()))?;
            self.client_credentials.extend(file.clients);
            self.cluster_credentials.extend(file.clusters);
        }
        Ok(())
    }

    /// Static credentials for a connection class.
    pub fn credentials(&self, class: ConnClass) -> &[Credential] {
        match class {
            ConnClass::Client => &self.client_credentials,
            ConnClass::Cluster => &self.cluster_credentials,
        }
    }

    pub fn match_client_credentials(&self, candidate: &Credential) -> bool {
        match_credentials(&self.client_credentials, candidate)
    }

    pub fn match_cluster_credentials(&self, candidate: &Credential) -> bool {
        match_credentials(&self.cluster_credentials, candidate)
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Wrap accepted sockets in TLS.
    pub enabled: bool,
    /// Path to PEM-encoded server certificate chain.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key.
    pub key_path: Option<PathBuf>,
    /// Path to PEM-encoded CA certificate(s) for verifying peers.
    pub ca_path: Option<PathBuf>,
    /// Require peers to present a certificate signed by `ca_path`.
    pub verify_clients: bool,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("NETD_TLS_ENABLED") {
            self.enabled = enabled;
        }
        if let Ok(path) = std::env::var("NETD_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("NETD_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("NETD_TLS_CA") {
            self.ca_path = Some(PathBuf::from(path));
        }
        if let Some(verify) = env_flag("NETD_TLS_VERIFY_CLIENTS") {
            self.verify_clients = verify;
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.verify_clients && self.ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "verify_clients enabled but ca_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Payload and timing limits handed to providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest single message a provider will send or parse.
    pub max_payload: usize,
    /// Largest amount of queued outbound data per connection.
    pub max_pending: usize,
    /// Ping interval in seconds.
    pub ping_interval_secs: u64,
    /// Credential read deadline for handlers, in milliseconds.
    pub auth_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload: crate::MAX_PAYLOAD_SIZE,
            max_pending: crate::MAX_PENDING_SIZE,
            ping_interval_secs: crate::DEFAULT_PING_INTERVAL.as_secs(),
            auth_timeout_ms: crate::AUTH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl LimitsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(max) = env_parse("NETD_MAX_PAYLOAD") {
            self.max_payload = max;
        }
        if let Some(secs) = env_parse("NETD_PING_INTERVAL") {
            self.ping_interval_secs = secs;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload == 0 {
            return Err(ConfigError::ValidationError(
                "max_payload must be positive".to_string(),
            ));
        }
        if self.max_pending < self.max_payload {
            return Err(ConfigError::ValidationError(format!(
                "max_pending ({}) is smaller than max_payload ({})",
                self.max_pending, self.max_payload
            )));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

/// Broadcast policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Return an error from `send_to_*` when any recipient failed.
    /// Failures are always logged; every recipient is always attempted.
    pub propagate_errors: bool,
}

impl BroadcastConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(propagate) = env_flag("NETD_BROADCAST_PROPAGATE_ERRORS") {
            self.propagate_errors = propagate;
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("NETD_METRICS_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(addr) = env_parse("NETD_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.client_addr.port(), 3508);
        assert_eq!(config.network.cluster_addr.port(), 3509);
        assert_eq!(config.network.handshake_timeout(), Duration::from_millis(500));
        assert_eq!(config.limits.max_payload, 1024 * 1024);
        assert_eq!(config.limits.ping_interval(), Duration::from_secs(120));
        assert!(!config.auth.enabled);
        assert!(!config.tls.enabled);
        assert!(!config.broadcast.propagate_errors);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.auth.client_credentials.push(Credential::new("alice", "secret"));
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.client_addr, config.network.client_addr);
        assert_eq!(parsed.auth.client_credentials, config.auth.client_credentials);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
network:
  client_addr: "0.0.0.0:4000"
auth:
  enabled: true
  client_credentials:
    - username: alice
      password: secret
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.client_addr.port(), 4000);
        assert_eq!(config.network.cluster_addr.port(), 3509);
        assert!(config.auth.enabled);
        assert!(!config.auth.required);
        assert!(config
            .auth
            .match_client_credentials(&Credential::new("alice", "secret")));
        assert!(!config
            .auth
            .match_cluster_credentials(&Credential::new("alice", "secret")));
    }

    #[test]
    fn test_credential_matching_is_exact() {
        let list = vec![Credential::new("alice", "secret"), Credential::new("bob", "hunter2")];
        assert!(match_credentials(&list, &Credential::new("bob", "hunter2")));
        assert!(!match_credentials(&list, &Credential::new("alice", "wrong")));
        assert!(!match_credentials(&list, &Credential::new("Alice", "secret")));
        assert!(!match_credentials(&list, &Credential::new("alice", "secret ")));
        assert!(!match_credentials(&[], &Credential::new("alice", "secret")));
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let debug = format!("{:?}", Credential::new("alice", "secret"));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_load_secrets_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "clients:\n  - username: carol\n    password: pw1\nclusters:\n  - username: node-a\n    password: pw2"
        )
        .unwrap();

        let mut auth = AuthConfig {
            client_credentials: vec![Credential::new("alice", "secret")],
            credentials_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        auth.load_secrets().unwrap();

        assert_eq!(auth.client_credentials.len(), 2);
        assert!(auth.match_client_credentials(&Credential::new("carol", "pw1")));
        assert!(auth.match_cluster_credentials(&Credential::new("node-a", "pw2")));
        assert_eq!(auth.credentials(ConnClass::Cluster).len(), 1);
    }

    #[test]
    fn test_load_secrets_missing_file() {
        let mut auth = AuthConfig {
            credentials_file: Some(PathBuf::from("/nonexistent/netd-credentials.yaml")),
            ..Default::default()
        };
        let err = auth.load_secrets().unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_tls_validation() {
        let mut tls = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(tls.validate().unwrap_err().to_string().contains("cert_path"));

        tls.cert_path = Some("/some/cert.pem".into());
        assert!(tls.validate().unwrap_err().to_string().contains("key_path"));

        tls.key_path = Some("/some/key.pem".into());
        assert!(tls.validate().is_ok());

        tls.verify_clients = true;
        assert!(tls.validate().unwrap_err().to_string().contains("ca_path"));
    }

    #[test]
    fn test_shared_listener_address_rejected() {
        let mut config = Config::default();
        config.network.cluster_addr = config.network.client_addr;
        assert!(config.validate().is_err());

        // Ephemeral ports never collide
        config.network.client_addr = "127.0.0.1:0".parse().unwrap();
        config.network.cluster_addr = "127.0.0.1:0".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_limits_validation() {
        let mut config = Config::default();
        config.limits.max_pending = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let file = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.network.client_addr = "127.0.0.1:7000".parse().unwrap();
        config.save(file.path()).unwrap();

        let loaded = Config::from_file(file.path()).unwrap();
        assert_eq!(loaded.network.client_addr.port(), 7000);
    }
}
