//! Fan-out of one payload to every provider of a class.

use crate::error::ServerError;
use crate::info::ConnClass;
use crate::state::Shared;

/// Delivers a payload to every registered provider of a class.
///
/// Recipients are attempted in registry order and a failing recipient never
/// stops delivery to the rest. Failures are logged; whether they are also
/// returned depends on `broadcast.propagate_errors`.
pub trait Broadcast {
    fn send_to_clients(&self, payload: &[u8]) -> Result<(), ServerError>;
    fn send_to_clusters(&self, payload: &[u8]) -> Result<(), ServerError>;
}

impl Shared {
    pub(crate) fn broadcast(&self, class: ConnClass, payload: &[u8]) -> Result<(), ServerError> {
        let state = self.state.lock();
        let class_state = state.class(class);
        let server_info = class_state.server_info.as_ref();

        tracing::debug!(
            "Broadcast to {} {}s started: {} bytes",
            class_state.providers.len(),
            class,
            payload.len()
        );

        let total = class_state.providers.len();
        let mut failed = 0;
        for entry in &class_state.providers {
            let recipient = entry.provider.base_info();
            tracing::trace!(
                target: "netd::trace",
                server = %server_info.map(|i| i.to_json()).unwrap_or_default(),
                recipient = %recipient,
                payload = %String::from_utf8_lossy(payload),
                "broadcast to {}",
                class
            );

            match entry.provider.send_message(payload) {
                Ok(()) => {
                    if let Some(ref metrics) = self.metrics {
                        metrics
                            .broadcast_messages_total
                            .with_label_values(&[class.as_str()])
                            .inc();
                    }
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(
                        "[{}] Failed to deliver to {}: {}",
                        recipient.socket_addr(),
                        class,
                        e
                    );
                    if let Some(ref metrics) = self.metrics {
                        metrics
                            .broadcast_failures_total
                            .with_label_values(&[class.as_str()])
                            .inc();
                    }
                }
            }
        }
        drop(state);

        tracing::debug!("Broadcast to {}s completed: {}/{} failed", class, failed, total);

        if failed > 0 && self.config.broadcast.propagate_errors {
            return Err(ServerError::Broadcast {
                class,
                failed,
                total,
            });
        }
        Ok(())
    }
}
