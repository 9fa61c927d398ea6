use crate::metrics::{Direction, Metrics};
use std::sync::atomic::{AtomicU64, Ordering};

/// Relay counters shared by the listener, the dispatcher and every bridge.
///
/// Each update is mirrored to the global `metrics` recorder.
#[derive(Debug, Default)]
pub struct RelayCounters {
    datagrams_received: AtomicU64,
    bytes_received: AtomicU64,
    relayed_to_backend: AtomicU64,
    relayed_to_client: AtomicU64,
    bytes_to_backend: AtomicU64,
    bytes_to_client: AtomicU64,
    discarded: AtomicU64,
    bridges_opened: AtomicU64,
    bridges_closed: AtomicU64,
}

impl RelayCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, bytes: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        Metrics::record_received(bytes);
    }

    pub fn record_relayed(&self, direction: Direction, bytes: usize) {
        let (packets, total) = match direction {
            Direction::ToBackend => (&self.relayed_to_backend, &self.bytes_to_backend),
            Direction::ToClient => (&self.relayed_to_client, &self.bytes_to_client),
        };
        packets.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
        Metrics::record_relayed(direction, bytes);
    }

    pub fn record_discarded(&self, reason: &'static str) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        Metrics::record_discarded(reason);
    }

    pub fn record_bridge_opened(&self) {
        self.bridges_opened.fetch_add(1, Ordering::Relaxed);
        Metrics::record_bridge_opened();
        Metrics::set_active_bridges(self.active_bridges());
    }

    pub fn record_bridge_closed(&self) {
        self.bridges_closed.fetch_add(1, Ordering::Relaxed);
        Metrics::set_active_bridges(self.active_bridges());
    }

    fn active_bridges(&self) -> u64 {
        let opened = self.bridges_opened.load(Ordering::Relaxed);
        opened.saturating_sub(self.bridges_closed.load(Ordering::Relaxed))
    }

    /// Snapshot the counters
    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            relayed_to_backend: self.relayed_to_backend.load(Ordering::Relaxed),
            relayed_to_client: self.relayed_to_client.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            bridges_opened: self.bridges_opened.load(Ordering::Relaxed),
            bridges_closed: self.bridges_closed.load(Ordering::Relaxed),
        }
    }
}

/// Voice relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub relayed_to_backend: u64,
    pub relayed_to_client: u64,
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
    pub discarded: u64,
    pub bridges_opened: u64,
    pub bridges_closed: u64,
}

impl RelayStats {
    /// Bridges whose receive loop is still running
    pub fn active_bridges(&self) -> u64 {
        self.bridges_opened.saturating_sub(self.bridges_closed)
    }
}
