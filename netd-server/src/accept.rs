//! Per-class accept loop.
//!
//! One loop runs per connection class. Each accepted socket is taken through
//! TLS, the handler and the authentication gate serially before the next
//! `accept()`; only admitted providers reach the registry.

use crate::auth::{AuthDecision, AuthPolicy};
use crate::info::{BaseInfo, ConnClass};
use crate::provider::{ConnectionContext, Connections, Handler, Provider};
use crate::state::Shared;
use crate::stream::NetStream;
use crate::tls::accept_with_deadline;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

/// Sleep schedule after temporary accept errors.
///
/// Starts at `min`, doubles after every consecutive error and stays at `max`
/// once reached. A successful accept resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Returns the delay to sleep now and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// The delay the next error would sleep.
    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(crate::ACCEPT_MIN_SLEEP, crate::ACCEPT_MAX_SLEEP)
    }
}

/// Returns whether an accept error is worth retrying after a pause.
pub fn is_temporary(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => true,
        _ => is_resource_exhaustion(err),
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    // ENOMEM, ENFILE, EMFILE
    matches!(err.raw_os_error(), Some(12) | Some(23) | Some(24))
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &io::Error) -> bool {
    false
}

pub(crate) struct AcceptLoop {
    pub(crate) class: ConnClass,
    pub(crate) listener: TcpListener,
    pub(crate) handler: Handler,
    pub(crate) shared: Arc<Shared>,
    pub(crate) server_info: BaseInfo,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) auth: AuthPolicy,
    pub(crate) shutdown: broadcast::Receiver<()>,
}

impl AcceptLoop {
    pub(crate) async fn run(mut self) {
        let class = self.class;
        tracing::info!(
            "{} loop started on {} ({})",
            class,
            self.server_info.socket_addr(),
            if self.tls.is_some() { "TLS" } else { "plain" }
        );

        let mut backoff = Backoff::default();

        loop {
            if !self.shared.is_class_running(class) {
                break;
            }

            let accepted = tokio::select! {
                result = self.listener.accept() => result,
                _ = self.shutdown.recv() => break,
            };

            match accepted {
                Ok((tcp, remote)) => {
                    backoff.reset();
                    self.handle_accepted(tcp, remote).await;
                }
                Err(e) if is_temporary(&e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "{} accept error: {}, sleeping for {}ms",
                        class,
                        e,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.recv() => break,
                    }
                }
                Err(e) => {
                    tracing::error!("{} accept error: {}", class, e);
                }
            }
        }

        tracing::info!("{} loop stopped", class);
    }

    async fn handle_accepted(&self, tcp: TcpStream, remote: SocketAddr) {
        let class = self.class;
        let config = &self.shared.config;
        let peer_info = BaseInfo::peer(remote, config.limits.max_payload);
        tracing::debug!("[{}] New {} connection", remote, class);

        if let Some(ref metrics) = self.shared.metrics {
            metrics
                .connections_accepted_total
                .with_label_values(&[class.as_str()])
                .inc();
        }

        let stream = match self.tls {
            Some(ref acceptor) => {
                match accept_with_deadline(acceptor, tcp, config.network.handshake_timeout()).await
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("[{}] {}", remote, e);
                        if let Some(ref metrics) = self.shared.metrics {
                            metrics
                                .tls_handshake_failures_total
                                .with_label_values(&[class.as_str()])
                                .inc();
                        }
                        return;
                    }
                }
            }
            None => NetStream::plain(tcp),
        };

        let ctx = ConnectionContext {
            stream,
            class,
            config: config.clone(),
            server_info: self.server_info.clone(),
            peer_info,
            connections: Connections::new(&self.shared),
            stats: self.shared.stats.clone(),
        };

        let provider = match (self.handler)(ctx).await {
            Ok(provider) => provider,
            Err(e) => {
                tracing::error!("[{}] Failed provider creation: {}", remote, e);
                self.count_rejection("handler_failed");
                return;
            }
        };

        let decision = self.auth.evaluate(provider.as_ref());
        if let Some(message) = decision.rejection_message() {
            tracing::warn!("[{}] {} rejected: {}", remote, class, decision.reason());
            self.reject(provider.as_ref(), message, decision);
            return;
        }

        if !self.shared.admit(class, provider.clone()) {
            tracing::debug!("[{}] {} listener stopped before admission", remote, class);
            if let Err(e) = provider.close() {
                tracing::debug!("[{}] Failed to close provider: {}", remote, e);
            }
            return;
        }

        tracing::info!("[{}] {} connected", remote, class);
    }

    fn reject(&self, provider: &dyn Provider, message: &str, decision: AuthDecision) {
        let remote = provider.base_info().socket_addr();
        if let Err(e) = provider.send_message(message.as_bytes()) {
            tracing::debug!("[{}] Failed to send rejection: {}", remote, e);
        }
        if let Err(e) = provider.close() {
            tracing::debug!("[{}] Failed to close provider: {}", remote, e);
        }
        self.count_rejection(decision.reason());
    }

    fn count_rejection(&self, reason: &str) {
        if let Some(ref metrics) = self.shared.metrics {
            metrics
                .connections_rejected_total
                .with_label_values(&[self.class.as_str(), reason])
                .inc();
        }
    }
}
