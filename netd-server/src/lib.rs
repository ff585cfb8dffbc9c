//! # netd-server
//!
//! Dual-role TCP connection server.
//!
//! This crate provides:
//! - Independent accept loops for clients and cluster peers
//! - Optional TLS upgrade under a handshake deadline
//! - Authentication against static credentials or a pluggable authenticator
//! - Connection registries with connect/disconnect hooks
//! - Broadcast to every connected client or cluster peer
//! - Atomic traffic counters and optional Prometheus metrics
//! - A ready-made line-oriented provider for handler authors

use std::time::Duration;

pub mod accept;
pub mod auth;
pub mod base;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod info;
pub mod metrics;
pub mod parser;
pub mod provider;
pub mod server;
mod state;
pub mod stats;
pub mod stream;
pub mod tls;

pub use accept::{is_temporary, Backoff};
pub use auth::{AuthDecision, AuthPolicy, Authenticator};
pub use base::{BaseProvider, MessageHandler, Responder};
pub use broadcast::Broadcast;
pub use config::{
    AuthConfig, BroadcastConfig, Config, ConfigError, Credential, LimitsConfig, MetricsConfig,
    NetworkConfig, TlsConfig,
};
pub use error::{ProviderError, ServerError};
pub use info::{BaseInfo, ConnClass, SearchableInfo};
pub use metrics::Metrics;
pub use parser::{LineParser, Message, MessageParser, ParseError};
pub use provider::{
    handler_fn, ClientAuth, CloseNotify, CloseSignal, ConnectionContext, Connections, Handler,
    Provider,
};
pub use server::{Server, ServerBuilder};
pub use stats::{Stat, StatSnapshot};
pub use stream::NetStream;

/// Version reported in every [`BaseInfo`].
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build identifier reported in every [`BaseInfo`].
pub const BUILD: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Default port for client connections.
pub const DEFAULT_CLIENT_PORT: u16 = 3508;

/// Default port for cluster peer connections.
pub const DEFAULT_CLUSTER_PORT: u16 = 3509;

/// Maximum payload size accepted by a provider (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum outbound bytes pending per connection (10 MiB).
pub const MAX_PENDING_SIZE: usize = 10 * 1024 * 1024;

/// Maximum size of a protocol control line.
pub const MAX_CONTROL_LINE_SIZE: usize = 1024;

/// Minimum sleep after a temporary accept error.
pub const ACCEPT_MIN_SLEEP: Duration = Duration::from_millis(10);

/// Maximum sleep after consecutive temporary accept errors.
pub const ACCEPT_MAX_SLEEP: Duration = Duration::from_secs(1);

/// TLS handshake deadline.
pub const TLS_TIMEOUT: Duration = Duration::from_millis(500);

/// Time a handler may spend reading credentials from a new connection.
pub const AUTH_TIMEOUT: Duration = Duration::from_millis(2 * 500);

/// Write/flush deadline for provider output.
pub const DEFAULT_FLUSH_DEADLINE: Duration = Duration::from_secs(2);

/// How often providers are expected to ping their peers.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(2 * 60);
