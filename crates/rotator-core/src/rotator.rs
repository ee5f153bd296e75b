//! Round-robin selection over the upstream pool, with edge-mode timing.

use crate::config::ProxyEntry;
use crate::error::DialError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long the pool must sit unused before an edge-enabled server prefers
/// a direct hop.
pub const EDGE_IDLE_THRESHOLD: Duration = Duration::from_secs(5);

struct PoolState {
    entries: Vec<Arc<ProxyEntry>>,
    cursor: usize,
    last_used: Instant,
}

/// Thread-safe rotator over the ordered upstream pool.
///
/// All pool state sits behind one mutex; the critical sections contain no
/// I/O. `edge_enabled` is immutable after construction and read without
/// locking.
pub struct Manager {
    state: Mutex<PoolState>,
    edge_enabled: bool,
    idle_threshold: Duration,
}

impl Manager {
    pub fn new(edge_enabled: bool) -> Self {
        Self::with_idle_threshold(edge_enabled, EDGE_IDLE_THRESHOLD)
    }

    /// Like [`Manager::new`] with a custom idle threshold. Tests use this to
    /// avoid multi-second sleeps.
    pub fn with_idle_threshold(edge_enabled: bool, idle_threshold: Duration) -> Self {
        Manager {
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                cursor: 0,
                last_used: Instant::now(),
            }),
            edge_enabled,
            idle_threshold,
        }
    }

    /// Replace the pool. An empty pool is only acceptable when edge mode is
    /// enabled.
    pub fn load(&self, entries: Vec<ProxyEntry>) -> Result<(), DialError> {
        if entries.is_empty() && !self.edge_enabled {
            return Err(DialError::NoProxiesConfigured);
        }
        let mut state = self.lock();
        state.entries = entries.into_iter().map(Arc::new).collect();
        state.cursor = 0;
        Ok(())
    }

    /// Return the next entry round-robin and stamp the pool as used.
    pub fn next(&self) -> Result<Arc<ProxyEntry>, DialError> {
        let mut state = self.lock();
        if state.entries.is_empty() {
            return Err(DialError::NoProxiesAvailable);
        }
        let entry = Arc::clone(&state.entries[state.cursor]);
        state.cursor = (state.cursor + 1) % state.entries.len();
        state.last_used = Instant::now();
        Ok(entry)
    }

    /// Whether the next dial should try a direct connection first: edge mode
    /// is on, and the pool is either empty or has been idle past the
    /// threshold. The decision reads one consistent snapshot under the lock.
    pub fn should_use_direct(&self) -> bool {
        if !self.edge_enabled {
            return false;
        }
        let state = self.lock();
        state.entries.is_empty() || state.last_used.elapsed() > self.idle_threshold
    }

    pub fn has_proxies(&self) -> bool {
        !self.lock().entries.is_empty()
    }

    pub fn is_edge_enabled(&self) -> bool {
        self.edge_enabled
    }

    pub fn proxy_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
