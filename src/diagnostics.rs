//! Diagnostics
//!
//! Counters describing what the driver core is doing. A [`Diagnostics`]
//! implementation is handed to every cluster, server and socket at
//! construction time; the default one discards everything.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Receiver of driver activity events.
///
/// Every method has an empty default body, so implementors only override
/// what they care about.
pub trait Diagnostics: Send + Sync {
    /// A cluster was created (+1) or torn down (-1)
    fn cluster(&self, _delta: i64) {}

    /// A connection to a master or slave was opened (+1) or lost (-1)
    fn conn(&self, _master: bool, _delta: i64) {}

    /// Operations written to the wire
    fn sent_ops(&self, _n: u64) {}

    /// Replies received from the wire
    fn received_ops(&self, _n: u64) {}

    /// Documents carried by received replies
    fn received_docs(&self, _n: u64) {}

    /// Sockets connected (+1) or killed (-1)
    fn sockets_alive(&self, _delta: i64) {}

    /// Sockets handed out of a pool (+1) or returned (-1)
    fn sockets_in_use(&self, _delta: i64) {}

    /// Socket references taken (+1) or dropped (-1)
    fn socket_refs(&self, _delta: i64) {}
}

/// Diagnostics sink that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl Diagnostics for NoopDiagnostics {}

/// Shared no-op diagnostics handle
pub fn noop() -> Arc<dyn Diagnostics> {
    Arc::new(NoopDiagnostics)
}

/// Atomic counters implementing [`Diagnostics`]
#[derive(Debug, Default)]
pub struct Stats {
    clusters: AtomicI64,
    master_conns: AtomicI64,
    slave_conns: AtomicI64,
    sent_ops: AtomicU64,
    received_ops: AtomicU64,
    received_docs: AtomicU64,
    sockets_alive: AtomicI64,
    sockets_in_use: AtomicI64,
    socket_refs: AtomicI64,
}

impl Stats {
    /// Create a zeroed collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a point-in-time copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            taken_at: chrono::Utc::now(),
            clusters: self.clusters.load(Ordering::Relaxed),
            master_conns: self.master_conns.load(Ordering::Relaxed),
            slave_conns: self.slave_conns.load(Ordering::Relaxed),
            sent_ops: self.sent_ops.load(Ordering::Relaxed),
            received_ops: self.received_ops.load(Ordering::Relaxed),
            received_docs: self.received_docs.load(Ordering::Relaxed),
            sockets_alive: self.sockets_alive.load(Ordering::Relaxed),
            sockets_in_use: self.sockets_in_use.load(Ordering::Relaxed),
            socket_refs: self.socket_refs.load(Ordering::Relaxed),
        }
    }

    /// Reset the traffic counters.
    ///
    /// Gauges (clusters, connections, sockets) describe live resources and
    /// are only zeroed when `hard` is set.
    pub fn reset(&self, hard: bool) {
        self.sent_ops.store(0, Ordering::Relaxed);
        self.received_ops.store(0, Ordering::Relaxed);
        self.received_docs.store(0, Ordering::Relaxed);
        if hard {
            self.clusters.store(0, Ordering::Relaxed);
            self.master_conns.store(0, Ordering::Relaxed);
            self.slave_conns.store(0, Ordering::Relaxed);
            self.sockets_alive.store(0, Ordering::Relaxed);
            self.sockets_in_use.store(0, Ordering::Relaxed);
            self.socket_refs.store(0, Ordering::Relaxed);
        }
    }
}

impl Diagnostics for Stats {
    fn cluster(&self, delta: i64) {
        self.clusters.fetch_add(delta, Ordering::Relaxed);
    }

    fn conn(&self, master: bool, delta: i64) {
        if master {
            self.master_conns.fetch_add(delta, Ordering::Relaxed);
        } else {
            self.slave_conns.fetch_add(delta, Ordering::Relaxed);
        }
    }

    fn sent_ops(&self, n: u64) {
        self.sent_ops.fetch_add(n, Ordering::Relaxed);
    }

    fn received_ops(&self, n: u64) {
        self.received_ops.fetch_add(n, Ordering::Relaxed);
    }

    fn received_docs(&self, n: u64) {
        self.received_docs.fetch_add(n, Ordering::Relaxed);
    }

    fn sockets_alive(&self, delta: i64) {
        self.sockets_alive.fetch_add(delta, Ordering::Relaxed);
    }

    fn sockets_in_use(&self, delta: i64) {
        self.sockets_in_use.fetch_add(delta, Ordering::Relaxed);
    }

    fn socket_refs(&self, delta: i64) {
        self.socket_refs.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Serializable copy of [`Stats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub taken_at: chrono::DateTime<chrono::Utc>,
    pub clusters: i64,
    pub master_conns: i64,
    pub slave_conns: i64,
    pub sent_ops: u64,
    pub received_ops: u64,
    pub received_docs: u64,
    pub sockets_alive: i64,
    pub sockets_in_use: i64,
    pub socket_refs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counting_and_reset() {
        let stats = Stats::new();
        stats.cluster(1);
        stats.conn(true, 1);
        stats.conn(false, 2);
        stats.sent_ops(3);
        stats.received_docs(7);
        stats.sockets_alive(2);
        stats.sockets_alive(-1);

        let snap = stats.snapshot();
        assert_eq!(snap.clusters, 1);
        assert_eq!(snap.master_conns, 1);
        assert_eq!(snap.slave_conns, 2);
        assert_eq!(snap.sent_ops, 3);
        assert_eq!(snap.received_docs, 7);
        assert_eq!(snap.sockets_alive, 1);

        stats.reset(false);
        let snap = stats.snapshot();
        assert_eq!(snap.sent_ops, 0);
        assert_eq!(snap.sockets_alive, 1);

        stats.reset(true);
        assert_eq!(stats.snapshot().sockets_alive, 0);
    }

    #[test]
    fn test_noop_accepts_events() {
        let diag = noop();
        diag.sent_ops(10);
        diag.socket_refs(-1);
    }
}
