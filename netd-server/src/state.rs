//! Shared server state: both registries, hook lists and loop handles behind
//! one lock.

use crate::auth::Authenticator;
use crate::config::Config;
use crate::info::{BaseInfo, ConnClass, SearchableInfo};
use crate::metrics::Metrics;
use crate::provider::Provider;
use crate::stats::Stat;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Connection lifecycle callback. Invoked while the server lock is held, so
/// it must not call back into the server.
pub(crate) type Hook = Arc<dyn Fn(&Arc<dyn Provider>) + Send + Sync>;

pub(crate) struct Entry {
    pub(crate) id: u64,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) waiter: Option<JoinHandle<()>>,
}

/// Everything the server tracks for one connection class.
#[derive(Default)]
pub(crate) struct ClassState {
    pub(crate) running: bool,
    pub(crate) providers: Vec<Entry>,
    pub(crate) on_connect: Vec<Hook>,
    pub(crate) on_disconnect: Vec<Hook>,
    pub(crate) server_info: Option<BaseInfo>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) task: Option<JoinHandle<()>>,
    pub(crate) shutdown: Option<broadcast::Sender<()>>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) clients: ClassState,
    pub(crate) clusters: ClassState,
    next_id: u64,
}

impl State {
    pub(crate) fn class(&self, class: ConnClass) -> &ClassState {
        match class {
            ConnClass::Client => &self.clients,
            ConnClass::Cluster => &self.clusters,
        }
    }

    pub(crate) fn class_mut(&mut self, class: ConnClass) -> &mut ClassState {
        match class {
            ConnClass::Client => &mut self.clients,
            ConnClass::Cluster => &mut self.clusters,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    pub(crate) config: Arc<Config>,
    pub(crate) stats: Arc<Stat>,
    pub(crate) metrics: Option<Arc<Metrics>>,
    pub(crate) server_id: String,
}

impl Shared {
    pub(crate) fn new(config: Arc<Config>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            config,
            stats: Arc::new(Stat::new()),
            metrics,
            server_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Whether either listener is running.
    pub(crate) fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.clients.running || state.clusters.running
    }

    pub(crate) fn is_class_running(&self, class: ConnClass) -> bool {
        self.state.lock().class(class).running
    }

    /// Registry snapshot in admission order.
    pub(crate) fn snapshot(&self, class: ConnClass) -> SearchableInfo {
        let state = self.state.lock();
        SearchableInfo::new(
            state
                .class(class)
                .providers
                .iter()
                .map(|e| e.provider.base_info())
                .collect(),
        )
    }

    pub(crate) fn add_hook(&self, class: ConnClass, connect: bool, hook: Hook) {
        let mut state = self.state.lock();
        let class_state = state.class_mut(class);
        if connect {
            class_state.on_connect.push(hook);
        } else {
            class_state.on_disconnect.push(hook);
        }
    }

    /// Registers `provider` if `class` is still running.
    ///
    /// The close-notify waiter is spawned and the entry inserted under the
    /// same lock, so a provider that closes immediately is still released.
    pub(crate) fn admit(self: &Arc<Self>, class: ConnClass, provider: Arc<dyn Provider>) -> bool {
        let mut state = self.state.lock();
        if !state.class(class).running {
            return false;
        }

        state.next_id += 1;
        let id = state.next_id;

        let notify = provider.close_notify();
        let weak: Weak<Shared> = Arc::downgrade(self);
        let watched = provider.clone();
        let waiter = tokio::spawn(async move {
            notify.closed().await;
            if let Some(shared) = weak.upgrade() {
                shared.release(class, id, &watched);
            }
        });

        let class_state = state.class_mut(class);
        class_state.providers.push(Entry {
            id,
            provider: provider.clone(),
            waiter: Some(waiter),
        });
        for hook in &class_state.on_connect {
            hook(&provider);
        }

        if class == ConnClass::Client {
            self.stats.increment_total_clients();
        }
        if let Some(ref metrics) = self.metrics {
            metrics
                .connections_active
                .with_label_values(&[class.as_str()])
                .inc();
        }

        true
    }

    /// Removes the entry `id` and runs the disconnect hooks. An entry that
    /// was already drained by shutdown still gets its hooks.
    fn release(&self, class: ConnClass, id: u64, provider: &Arc<dyn Provider>) {
        let mut state = self.state.lock();
        let class_state = state.class_mut(class);

        if let Some(pos) = class_state.providers.iter().position(|e| e.id == id) {
            class_state.providers.remove(pos);
            if let Some(ref metrics) = self.metrics {
                metrics
                    .connections_active
                    .with_label_values(&[class.as_str()])
                    .dec();
            }
        }

        tracing::debug!(
            "[{}] {} disconnected",
            provider.base_info().socket_addr(),
            class
        );
        for hook in &class_state.on_disconnect {
            hook(provider);
        }
    }

    /// Takes every entry of `class` out of its registry.
    pub(crate) fn drain(&self, class: ConnClass) -> Vec<Entry> {
        let mut state = self.state.lock();
        let drained: Vec<Entry> = state.class_mut(class).providers.drain(..).collect();
        if let Some(ref metrics) = self.metrics {
            metrics
                .connections_active
                .with_label_values(&[class.as_str()])
                .sub(drained.len() as f64);
        }
        drained
    }

    /// Sends a stop signal to every running accept loop.
    pub(crate) fn signal_shutdown(&self) {
        let state = self.state.lock();
        for class_state in [&state.clients, &state.clusters] {
            if let Some(ref tx) = class_state.shutdown {
                let _ = tx.send(());
            }
        }
    }
}
