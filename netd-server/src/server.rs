//! TCP server implementation.

use crate::accept::AcceptLoop;
use crate::auth::{AuthPolicy, Authenticator};
use crate::broadcast::Broadcast;
use crate::config::Config;
use crate::error::ServerError;
use crate::info::{BaseInfo, ConnClass, SearchableInfo};
use crate::metrics::Metrics;
use crate::provider::{Connections, Handler, Provider};
use crate::state::{Hook, Shared};
use crate::stats::Stat;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: Config,
    client_authenticator: Option<Arc<dyn Authenticator>>,
    cluster_authenticator: Option<Arc<dyn Authenticator>>,
    metrics: Option<Arc<Metrics>>,
}

impl ServerBuilder {
    /// Sets the authenticator consulted for client connections.
    pub fn client_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.client_authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Sets the authenticator consulted for cluster peer connections.
    pub fn cluster_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.cluster_authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Sets the metrics instance.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration and resolves TLS material.
    pub fn build(self) -> Result<Server, ServerError> {
        self.config.validate()?;
        self.config.tls_acceptor()?;

        let shared = Arc::new(Shared::new(Arc::new(self.config), self.metrics));
        {
            let mut state = shared.state.lock();
            state.clients.authenticator = self.client_authenticator;
            state.clusters.authenticator = self.cluster_authenticator;
        }

        Ok(Server { shared })
    }
}

/// Dual-role TCP server: one listener for clients, one for cluster peers.
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Creates a server without authenticators or metrics.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            client_authenticator: None,
            cluster_authenticator: None,
            metrics: None,
        }
    }

    /// Starts accepting clients. Returns the bound address; calling it again
    /// while running returns the same address.
    pub async fn serve_clients(&self, handler: Handler) -> Result<SocketAddr, ServerError> {
        self.serve(ConnClass::Client, handler).await
    }

    /// Starts accepting cluster peers. Returns the bound address; calling it
    /// again while running returns the same address.
    pub async fn serve_clusters(&self, handler: Handler) -> Result<SocketAddr, ServerError> {
        self.serve(ConnClass::Cluster, handler).await
    }

    async fn serve(&self, class: ConnClass, handler: Handler) -> Result<SocketAddr, ServerError> {
        let config = &self.shared.config;

        let authenticator = {
            let state = self.shared.state.lock();
            let class_state = state.class(class);
            if class_state.running {
                return Ok(class_state
                    .local_addr
                    .unwrap_or_else(|| config.listen_addr(class)));
            }
            class_state.authenticator.clone()
        };

        let auth = AuthPolicy::for_class(&config.auth, class, authenticator);
        if auth.enabled && !auth.has_source() {
            return Err(ServerError::NoAuthSource(class));
        }
        let tls = config.tls_acceptor()?;

        let addr = config.listen_addr(class);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let server_info = BaseInfo::server(
            local_addr,
            &self.shared.server_id,
            config.limits.max_payload,
        );

        let mut state = self.shared.state.lock();
        let class_state = state.class_mut(class);
        if class_state.running {
            // Another call won the race; this listener is dropped
            return Ok(class_state.local_addr.unwrap_or(local_addr));
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept = AcceptLoop {
            class,
            listener,
            handler,
            shared: self.shared.clone(),
            server_info: server_info.clone(),
            tls,
            auth,
            shutdown: shutdown_rx,
        };

        class_state.running = true;
        class_state.local_addr = Some(local_addr);
        class_state.server_info = Some(server_info);
        class_state.shutdown = Some(shutdown_tx);
        class_state.task = Some(tokio::spawn(accept.run()));

        tracing::info!("Serving {}s on {}", class, local_addr);
        Ok(local_addr)
    }

    /// Stops both listeners and closes every registered provider.
    ///
    /// Waits for the accept loops to exit, then for providers to report
    /// closure within `network.shutdown_grace_secs`. No-op when not running.
    pub async fn close(&self) {
        let tasks = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if !state.clients.running && !state.clusters.running {
                return;
            }

            let mut tasks = Vec::new();
            for class_state in [&mut state.clients, &mut state.clusters] {
                class_state.running = false;
                if let Some(tx) = class_state.shutdown.take() {
                    let _ = tx.send(());
                }
                tasks.extend(class_state.task.take());
            }
            tasks
        };

        tracing::info!("Server shutting down");
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
        }

        let mut waiters = Vec::new();
        for class in [ConnClass::Client, ConnClass::Cluster] {
            for entry in self.shared.drain(class) {
                if let Err(e) = entry.provider.close() {
                    tracing::error!(
                        "[{}] Failed to close {}: {}",
                        entry.provider.base_info().socket_addr(),
                        class,
                        e
                    );
                }
                waiters.extend(entry.waiter);
            }
        }

        let grace = self.shared.config.network.shutdown_grace();
        let aborts: Vec<_> = waiters.iter().map(|w| w.abort_handle()).collect();
        let pending = waiters.len();
        let wait_all = async {
            for waiter in waiters {
                let _ = waiter.await;
            }
        };
        if tokio::time::timeout(grace, wait_all).await.is_err() {
            tracing::warn!(
                "Providers did not close within {:?}, abandoning {} waiters",
                grace,
                pending
            );
            for abort in aborts {
                abort.abort();
            }
        }

        tracing::info!("Server closed");
    }

    /// Whether either listener is running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Snapshot of registered clients.
    pub fn clients(&self) -> SearchableInfo {
        self.shared.snapshot(ConnClass::Client)
    }

    /// Snapshot of registered cluster peers.
    pub fn clusters(&self) -> SearchableInfo {
        self.shared.snapshot(ConnClass::Cluster)
    }

    /// Registers a callback run after a client is admitted.
    ///
    /// Callbacks run under the server lock in registration order and must not
    /// call back into the server.
    pub fn on_client_connect<F>(&self, hook: F)
    where
        F: Fn(&Arc<dyn Provider>) + Send + Sync + 'static,
    {
        self.add_hook(ConnClass::Client, true, Arc::new(hook));
    }

    /// Registers a callback run when a client's close-notify fires.
    pub fn on_client_disconnect<F>(&self, hook: F)
    where
        F: Fn(&Arc<dyn Provider>) + Send + Sync + 'static,
    {
        self.add_hook(ConnClass::Client, false, Arc::new(hook));
    }

    /// Registers a callback run after a cluster peer is admitted.
    pub fn on_cluster_connect<F>(&self, hook: F)
    where
        F: Fn(&Arc<dyn Provider>) + Send + Sync + 'static,
    {
        self.add_hook(ConnClass::Cluster, true, Arc::new(hook));
    }

    /// Registers a callback run when a cluster peer's close-notify fires.
    pub fn on_cluster_disconnect<F>(&self, hook: F)
    where
        F: Fn(&Arc<dyn Provider>) + Send + Sync + 'static,
    {
        self.add_hook(ConnClass::Cluster, false, Arc::new(hook));
    }

    fn add_hook(&self, class: ConnClass, connect: bool, hook: Hook) {
        self.shared.add_hook(class, connect, hook);
    }

    /// Handle to the registries that does not keep the server alive.
    pub fn connections(&self) -> Connections {
        Connections::new(&self.shared)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn stats(&self) -> Arc<Stat> {
        self.shared.stats.clone()
    }

    pub fn metrics(&self) -> Option<Arc<Metrics>> {
        self.shared.metrics.clone()
    }

    /// Id shared by both listeners' [`BaseInfo`].
    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    /// Bound client address, once serving.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().clients.local_addr
    }

    /// Bound cluster address, once serving.
    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().clusters.local_addr
    }

    /// Identity of the client listener, once serving.
    pub fn client_info(&self) -> Option<BaseInfo> {
        self.shared.state.lock().clients.server_info.clone()
    }

    /// Identity of the cluster listener, once serving.
    pub fn cluster_info(&self) -> Option<BaseInfo> {
        self.shared.state.lock().clusters.server_info.clone()
    }
}

impl Broadcast for Server {
    fn send_to_clients(&self, payload: &[u8]) -> Result<(), ServerError> {
        self.shared.broadcast(ConnClass::Client, payload)
    }

    fn send_to_clusters(&self, payload: &[u8]) -> Result<(), ServerError> {
        self.shared.broadcast(ConnClass::Cluster, payload)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.signal_shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("server_id", &self.shared.server_id)
            .field("client_addr", &self.client_addr())
            .field("cluster_addr", &self.cluster_addr())
            .field("running", &self.is_running())
            .finish()
    }
}
