//! Server error types.

use crate::config::ConfigError;
use crate::info::ConnClass;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Server errors.
///
/// Only start-up errors (bind, TLS material, configuration) reach the caller
/// of [`Server`](crate::Server). Per-connection failures are logged inside the
/// accept loop and never propagate.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("authentication enabled for {0} connections but no authenticator or credentials are configured")]
    NoAuthSource(ConnClass),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("TLS handshake timed out after {0:?}")]
    TlsHandshakeTimeout(Duration),

    #[error("broadcast to {class}s failed for {failed} of {total} recipients")]
    Broadcast {
        class: ConnClass,
        failed: usize,
        total: usize,
    },

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether this error happened before any connection was served.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::Bind { .. }
                | ServerError::Config(_)
                | ServerError::NoAuthSource(_)
                | ServerError::TlsConfig(_)
                | ServerError::Metrics(_)
        )
    }
}

/// Errors raised by a [`Provider`](crate::Provider) or while constructing one.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("outbound queue full")]
    Backpressure,

    #[error("provider closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let bind = ServerError::Bind {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_fatal());
        assert!(ServerError::NoAuthSource(ConnClass::Client).is_fatal());
        assert!(ServerError::TlsConfig("bad".into()).is_fatal());

        assert!(!ServerError::TlsHandshake("eof".into()).is_fatal());
        assert!(!ServerError::ShuttingDown.is_fatal());
        assert!(!ServerError::Broadcast {
            class: ConnClass::Cluster,
            failed: 1,
            total: 3
        }
        .is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::Broadcast {
            class: ConnClass::Client,
            failed: 2,
            total: 5,
        };
        assert_eq!(
            err.to_string(),
            "broadcast to clients failed for 2 of 5 recipients"
        );

        let err = ServerError::NoAuthSource(ConnClass::Cluster);
        assert!(err.to_string().contains("cluster"));

        let err = ProviderError::PayloadTooLarge { size: 10, max: 4 };
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains("4"));
    }
}
