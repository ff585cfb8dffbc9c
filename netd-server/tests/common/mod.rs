//! Shared utilities for integration testing.

#![allow(dead_code)]

use netd_server::base::read_control_line;
use netd_server::{
    handler_fn, BaseInfo, ClientAuth, CloseNotify, CloseSignal, Config, ConnectionContext,
    Credential, Handler, NetStream, Provider, ProviderError,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

/// Provider that records what the server does to it.
pub struct MockProvider {
    pub info: BaseInfo,
    pub tls: bool,
    stream: Mutex<Option<NetStream>>,
    sent: Mutex<Vec<Vec<u8>>>,
    attempts: AtomicUsize,
    close_calls: AtomicUsize,
    signal: CloseSignal,
    credentials: Option<Credential>,
    fail_send: bool,
}

impl MockProvider {
    pub fn new(ctx: ConnectionContext, credentials: Option<Credential>, fail_send: bool) -> Self {
        Self {
            info: ctx.peer_info,
            tls: ctx.stream.is_tls(),
            stream: Mutex::new(Some(ctx.stream)),
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            signal: CloseSignal::new(),
            credentials,
            fail_send,
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Provider for MockProvider {
    fn send_message(&self, payload: &[u8]) -> Result<(), ProviderError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_send {
            return Err(ProviderError::Closed);
        }
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    fn close(&self) -> Result<(), ProviderError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.stream.lock().unwrap().take();
        self.signal.fire();
        Ok(())
    }

    fn close_notify(&self) -> CloseNotify {
        self.signal.subscribe()
    }

    fn base_info(&self) -> BaseInfo {
        self.info.clone()
    }

    fn client_auth(&self) -> Option<&dyn ClientAuth> {
        self.credentials.as_ref().map(|c| c as &dyn ClientAuth)
    }
}

/// Every provider a handler built, in construction order.
pub type Created = Arc<Mutex<Vec<Arc<MockProvider>>>>;

pub fn created() -> Created {
    Arc::new(Mutex::new(Vec::new()))
}

/// Builds a mock without credentials. The provider at index `fail_index`
/// (construction order) fails every send.
pub fn mock_handler(created: Created, fail_index: Option<usize>) -> Handler {
    handler_fn(move |ctx: ConnectionContext| {
        let created = created.clone();
        async move {
            let mut list = created.lock().unwrap();
            let fail = fail_index == Some(list.len());
            let provider = Arc::new(MockProvider::new(ctx, None, fail));
            list.push(provider.clone());
            Ok::<_, ProviderError>(provider as Arc<dyn Provider>)
        }
    })
}

/// Reads one line from the peer before building the mock: `<user> <pass>`
/// attaches credentials, anything else builds an anonymous provider.
pub fn credential_handler(created: Created) -> Handler {
    handler_fn(move |mut ctx: ConnectionContext| {
        let created = created.clone();
        async move {
            let line = tokio::time::timeout(
                Duration::from_secs(2),
                read_control_line(&mut ctx.stream, 256),
            )
            .await
            .map_err(|_| ProviderError::Handshake("no credential line".into()))??
            .unwrap_or_default();

            let mut parts = line.split_whitespace();
            let credentials = match (parts.next(), parts.next()) {
                (Some(user), Some(pass)) => Some(Credential::new(user, pass)),
                _ => None,
            };
            let provider = Arc::new(MockProvider::new(ctx, credentials, false));
            created.lock().unwrap().push(provider.clone());
            Ok::<_, ProviderError>(provider as Arc<dyn Provider>)
        }
    })
}

/// Counts entry into the handler, then sleeps for `delay` before building a
/// mock without credentials.
pub fn slow_handler(created: Created, entered: Arc<AtomicUsize>, delay: Duration) -> Handler {
    handler_fn(move |ctx: ConnectionContext| {
        let created = created.clone();
        let entered = entered.clone();
        async move {
            entered.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            let provider = Arc::new(MockProvider::new(ctx, None, false));
            created.lock().unwrap().push(provider.clone());
            Ok::<_, ProviderError>(provider as Arc<dyn Provider>)
        }
    })
}

/// Handler that always fails and counts its calls.
pub fn failing_handler(calls: Arc<AtomicUsize>) -> Handler {
    handler_fn(move |_ctx: ConnectionContext| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Arc<dyn Provider>, _>(ProviderError::Handshake("refused".into()))
        }
    })
}

/// Routes server logs to the test harness. `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Configuration with both listeners on ephemeral loopback ports.
pub fn local_config() -> Config {
    init_tracing();
    let mut config = Config::default();
    config.network.client_addr = "127.0.0.1:0".parse().unwrap();
    config.network.cluster_addr = "127.0.0.1:0".parse().unwrap();
    config.network.shutdown_grace_secs = 2;
    config
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

pub fn created_len(created: &Created) -> usize {
    created.lock().unwrap().len()
}

pub fn provider_at(created: &Created, index: usize) -> Arc<MockProvider> {
    created.lock().unwrap()[index].clone()
}
