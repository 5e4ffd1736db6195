//! Atomic counters for enforcement observability.
//!
//! Counters are incremented silently at the call site; the core exposes a
//! [`Metrics::snapshot`] through its metrics query. Owned by the core
//! instance — no global state, so tests get clean counters for free.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lightweight atomic counters — no allocations, no locking.
#[derive(Debug, Default)]
pub struct Metrics {
    total_actions: AtomicU64,
    blocked_actions: AtomicU64,
    threats_detected: AtomicU64,
    agent_kills: AtomicU64,
}

/// Point-in-time counter values, plus registry sizes filled in by the core.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_actions: u64,
    pub blocked_actions: u64,
    pub threats_detected: u64,
    pub agent_kills: u64,
    pub monitored_agents: usize,
    pub blocked_agents: usize,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            total_actions: AtomicU64::new(0),
            blocked_actions: AtomicU64::new(0),
            threats_detected: AtomicU64::new(0),
            agent_kills: AtomicU64::new(0),
        }
    }

    pub fn inc_total_actions(&self) {
        self.total_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked_actions(&self) {
        self.blocked_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_threats_detected(&self) {
        self.threats_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_agent_kills(&self) {
        self.agent_kills.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values with the registry sizes supplied by the caller.
    pub fn snapshot(&self, monitored_agents: usize, blocked_agents: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            total_actions: self.total_actions.load(Ordering::Relaxed),
            blocked_actions: self.blocked_actions.load(Ordering::Relaxed),
            threats_detected: self.threats_detected.load(Ordering::Relaxed),
            agent_kills: self.agent_kills.load(Ordering::Relaxed),
            monitored_agents,
            blocked_agents,
        }
    }

    /// Reset all counters to zero (test teardown).
    pub fn reset(&self) {
        self.total_actions.store(0, Ordering::Relaxed);
        self.blocked_actions.store(0, Ordering::Relaxed);
        self.threats_detected.store(0, Ordering::Relaxed);
        self.agent_kills.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_total_actions();
        m.inc_total_actions();
        m.inc_blocked_actions();
        m.inc_threats_detected();
        m.inc_agent_kills();

        let snap = m.snapshot(3, 1);
        assert_eq!(snap.total_actions, 2);
        assert_eq!(snap.blocked_actions, 1);
        assert_eq!(snap.threats_detected, 1);
        assert_eq!(snap.agent_kills, 1);
        assert_eq!(snap.monitored_agents, 3);
        assert_eq!(snap.blocked_agents, 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_total_actions();
        m.inc_agent_kills();
        m.reset();
        let snap = m.snapshot(0, 0);
        assert_eq!(snap.total_actions, 0);
        assert_eq!(snap.agent_kills, 0);
    }
}
