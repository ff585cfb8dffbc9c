//! Traffic counters shared by every provider of one server.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Independently incrementing counters.
///
/// Shared by reference (`Arc<Stat>`) across all connection tasks; every
/// update is a single relaxed atomic add.
#[derive(Debug, Default)]
pub struct Stat {
    in_msgs: AtomicU64,
    out_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    requests: AtomicU64,
    total_clients: AtomicU64,
}

/// Plain copy of the counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub requests: u64,
    pub total_clients: u64,
}

impl Stat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_in_msg(&self) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_out_msg(&self) {
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `size` inbound bytes.
    pub fn increment_reads(&self, size: usize) {
        self.in_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Adds `size` outbound bytes.
    pub fn increment_writes(&self, size: usize) {
        self.out_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn increment_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_total_clients(&self) {
        self.total_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            total_clients: self.total_clients.load(Ordering::Relaxed),
        }
    }
}
