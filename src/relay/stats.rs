use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters describing relay activity since startup.
#[derive(Debug, Default)]
pub struct RelayStats {
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    messages_relayed: AtomicU64,
    parse_failures: AtomicU64,
    broadcast_deliveries: AtomicU64,
    send_failures: AtomicU64,
    probes_sent: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub messages_relayed: u64,
    pub parse_failures: u64,
    pub broadcast_deliveries: u64,
    pub send_failures: u64,
    pub probes_sent: u64,
    pub evictions: u64,
}

impl RelayStats {
    pub(crate) fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fan_out(&self, delivered: u64, failed: u64) {
        self.broadcast_deliveries.fetch_add(delivered, Ordering::Relaxed);
        self.send_failures.fetch_add(failed, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_probe(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            broadcast_deliveries: self.broadcast_deliveries.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RelayStats::default();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_closed();
        stats.record_fan_out(3, 1);
        stats.record_send_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.broadcast_deliveries, 3);
        assert_eq!(snapshot.send_failures, 2);
        assert_eq!(snapshot.probes_sent, 0);
    }
}
