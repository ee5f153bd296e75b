//! Process-wide connection counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free counters for the serving loop: currently active connections,
/// total accepted, and bytes moved in each direction.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    active: AtomicUsize,
    total: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Arc<Self> {
        Arc::new(ConnectionStats::default())
    }

    pub fn connection_opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// `up` is client-to-upstream, `down` is upstream-to-client.
    pub fn record_transfer(&self, up: u64, down: u64) {
        self.bytes_up.fetch_add(up, Ordering::Relaxed);
        self.bytes_down.fetch_add(down, Ordering::Relaxed);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}
