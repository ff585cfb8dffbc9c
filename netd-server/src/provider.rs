//! The per-connection provider contract and what a handler receives.

use crate::broadcast::Broadcast;
use crate::config::{Config, Credential};
use crate::error::{ProviderError, ServerError};
use crate::info::{BaseInfo, ConnClass, SearchableInfo};
use crate::state::Shared;
use crate::stats::Stat;
use crate::stream::NetStream;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Exposes the credentials a connection presented.
pub trait ClientAuth: Send + Sync {
    fn credentials(&self) -> Credential;
}

impl ClientAuth for Credential {
    fn credentials(&self) -> Credential {
        self.clone()
    }
}

/// Owns the protocol spoken over one accepted connection.
///
/// Implementations must not block. `send_message` is called by broadcast
/// while the server lock is held; `close` is called from the accept loop and
/// from shutdown outside the lock.
pub trait Provider: Send + Sync + 'static {
    /// Queues `payload` for delivery to the peer.
    fn send_message(&self, payload: &[u8]) -> Result<(), ProviderError>;

    /// Ends the connection. The close-notify signal fires once the provider
    /// has finished.
    fn close(&self) -> Result<(), ProviderError>;

    /// One-shot signal that resolves when the provider is finished.
    fn close_notify(&self) -> CloseNotify;

    /// Identity of the peer this provider serves.
    fn base_info(&self) -> BaseInfo;

    /// The authentication capability, if this provider carries credentials.
    fn client_auth(&self) -> Option<&dyn ClientAuth> {
        None
    }
}

/// Sending side of a provider's close-notify signal.
#[derive(Debug)]
pub struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fires the signal. Returns true only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> CloseNotify {
        CloseNotify {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a close-notify signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CloseNotify {
    rx: watch::Receiver<bool>,
}

impl CloseNotify {
    /// Resolves once the signal fired or its sender was dropped.
    pub async fn closed(mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Everything a handler needs to build a provider for one accepted socket.
///
/// Ownership of `stream` moves into the provider; dropping the context
/// closes the connection.
pub struct ConnectionContext {
    pub stream: NetStream,
    pub class: ConnClass,
    pub config: Arc<Config>,
    pub server_info: BaseInfo,
    pub peer_info: BaseInfo,
    pub connections: Connections,
    pub stats: Arc<Stat>,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("class", &self.class)
            .field("tls", &self.stream.is_tls())
            .field("server_info", &self.server_info)
            .field("peer_info", &self.peer_info)
            .finish()
    }
}

/// Future returned by a [`Handler`].
pub type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<Arc<dyn Provider>, ProviderError>> + Send>>;

/// Turns an accepted connection into a provider. Runs inline in the accept
/// loop, so it must not wait indefinitely.
pub type Handler = Arc<dyn Fn(ConnectionContext) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(ConnectionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn Provider>, ProviderError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Handle back into the server's registries, given to every provider.
///
/// Holds a weak reference: once the server is gone, queries return empty
/// results and broadcasts fail with [`ServerError::ShuttingDown`].
#[derive(Clone)]
pub struct Connections {
    shared: Weak<Shared>,
}

impl Connections {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// A handle not tied to any server.
    pub fn detached() -> Self {
        Self {
            shared: Weak::new(),
        }
    }

    pub fn clients(&self) -> SearchableInfo {
        self.snapshot(ConnClass::Client)
    }

    pub fn clusters(&self) -> SearchableInfo {
        self.snapshot(ConnClass::Cluster)
    }

    fn snapshot(&self, class: ConnClass) -> SearchableInfo {
        self.shared
            .upgrade()
            .map(|shared| shared.snapshot(class))
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.is_running())
            .unwrap_or(false)
    }
}

impl Broadcast for Connections {
    fn send_to_clients(&self, payload: &[u8]) -> Result<(), ServerError> {
        let shared = self.shared.upgrade().ok_or(ServerError::ShuttingDown)?;
        shared.broadcast(ConnClass::Client, payload)
    }

    fn send_to_clusters(&self, payload: &[u8]) -> Result<(), ServerError> {
        let shared = self.shared.upgrade().ok_or(ServerError::ShuttingDown)?;
        shared.broadcast(ConnClass::Cluster, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_fires_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_notify_resolves_after_fire() {
        let signal = CloseSignal::new();
        let notify = signal.subscribe();
        assert!(!notify.is_closed());

        let waiter = tokio::spawn(notify.clone().closed());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(notify.is_closed());
    }

    #[tokio::test]
    async fn test_notify_after_fire_resolves_immediately() {
        let signal = CloseSignal::new();
        signal.fire();
        tokio::time::timeout(Duration::from_millis(100), signal.subscribe().closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_notify_resolves_when_signal_dropped() {
        let signal = CloseSignal::new();
        let notify = signal.subscribe();
        drop(signal);
        tokio::time::timeout(Duration::from_millis(100), notify.closed())
            .await
            .unwrap();
    }

    #[test]
    fn test_detached_connections() {
        let connections = Connections::detached();
        assert!(connections.clients().is_empty());
        assert!(!connections.is_running());
        assert!(matches!(
            connections.send_to_clients(b"x"),
            Err(ServerError::ShuttingDown)
        ));
    }

    #[test]
    fn test_credential_is_client_auth() {
        let cred = Credential::new("alice", "secret");
        let auth: &dyn ClientAuth = &cred;
        assert_eq!(auth.credentials(), cred);
    }
}
