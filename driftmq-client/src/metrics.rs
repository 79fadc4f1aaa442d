//! Metrics collection for a DriftMQ session

use std::sync::atomic::{AtomicU64, Ordering};

/// Session metrics collector
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Producer metrics
    pub messages_published: AtomicU64,
    pub bytes_published: AtomicU64,
    pub messages_acked: AtomicU64,
    pub messages_resent: AtomicU64,

    // Consumer metrics
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub messages_dropped: AtomicU64,

    // Connection metrics
    pub connections_established: AtomicU64,
    pub connections_failed: AtomicU64,
    pub connections_lost: AtomicU64,
    pub pings_sent: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self, bytes: usize) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_acked(&self, count: usize) {
        self.messages_acked
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_resent(&self, count: usize) {
        self.messages_resent
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_resent: self.messages_resent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connections_lost: self.connections_lost.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ClientMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub bytes_published: u64,
    pub messages_acked: u64,
    pub messages_resent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_dropped: u64,
    pub connections_established: u64,
    pub connections_failed: u64,
    pub connections_lost: u64,
    pub pings_sent: u64,
}

impl MetricsSnapshot {
    /// Publishes still waiting for an acknowledgement
    pub fn unacked(&self) -> u64 {
        self.messages_published
            .saturating_sub(self.messages_acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = ClientMetrics::new();
        metrics.record_publish(10);
        metrics.record_publish(5);
        metrics.record_acked(1);
        metrics.record_received(3);
        metrics.record_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 2);
        assert_eq!(snapshot.bytes_published, 15);
        assert_eq!(snapshot.unacked(), 1);
        assert_eq!(snapshot.bytes_received, 3);
        assert_eq!(snapshot.messages_dropped, 1);
    }
}
