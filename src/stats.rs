//! Traffic counters shared between every relayed connection and `TunnelManager::get_stats`.
//!
//! Writers never coordinate with each other beyond atomic increments; readers tolerate
//! slight skew across fields (§5 — no cross-field atomicity required).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of `Stats`, returned by `get_stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    active: AtomicU64,
    total: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    /// Called once per accepted ProxiedConnection as it is handed to a Relay.
    pub fn connection_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once as a ProxiedConnection's Relay exits.
    pub fn connection_ended(&self) {
        // active only ever rises on start and falls on end, so a saturating
        // decrement can't underflow outside of a logic bug.
        self.active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |a| Some(a.saturating_sub(1)))
            .ok();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_rises_and_falls() {
        let stats = Stats::new();
        stats.connection_started();
        stats.connection_started();
        assert_eq!(stats.snapshot().active, 2);
        assert_eq!(stats.snapshot().total, 2);
        stats.connection_ended();
        assert_eq!(stats.snapshot().active, 1);
        assert_eq!(stats.snapshot().total, 2);
    }

    #[test]
    fn byte_counters_accumulate() {
        let stats = Stats::new();
        stats.add_up(10);
        stats.add_up(5);
        stats.add_down(3);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_up, 15);
        assert_eq!(snap.bytes_down, 3);
    }
}
