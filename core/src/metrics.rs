//! # DriftMQ Broker Metrics
//!
//! Lock-free counters updated on the connection and delivery hot paths.
//!
//! Every counter is a single atomic; updates never allocate or take a lock.
//! Hot counters are cache-line aligned so connections on different cores do
//! not contend on the same line. [`BrokerMetrics::snapshot`] reads all
//! counters into a plain serializable struct for logging or export.
//!
//! ```rust,no_run
//! use driftmq::metrics::BrokerMetrics;
//!
//! let metrics = BrokerMetrics::new();
//! metrics.message_published(128);
//! println!("{}", metrics.snapshot().to_json().unwrap());
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Ensure structures are cache-line aligned to prevent false sharing
#[repr(align(64))]
#[derive(Debug, Default)]
struct CacheLineAligned<T>(T);

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    active_connections: CacheLineAligned<AtomicUsize>,
    total_connections: AtomicU64,
    frames_received: CacheLineAligned<AtomicU64>,
    frames_sent: CacheLineAligned<AtomicU64>,
    messages_published: CacheLineAligned<AtomicU64>,
    bytes_published: AtomicU64,
    messages_delivered: CacheLineAligned<AtomicU64>,
    bytes_delivered: AtomicU64,
    active_subscriptions: AtomicUsize,
    topic_count: AtomicUsize,
    storage_errors: AtomicU64,
    protocol_errors: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.active_connections.0.fetch_add(1, Ordering::AcqRel);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.0.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn frame_received(&self) {
        self.frames_received.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn frame_sent(&self) {
        self.frames_sent.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn message_published(&self, bytes: u64) {
        self.messages_published.0.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn message_delivered(&self, bytes: u64) {
        self.messages_delivered.0.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn subscription_opened(&self) {
        self.active_subscriptions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn subscription_closed(&self) {
        self.active_subscriptions.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn update_topic_count(&self, count: usize) {
        self.topic_count.store(count, Ordering::Release);
    }

    pub fn storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.0.load(Ordering::Acquire)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(Ordering::Acquire)
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.0.load(Ordering::Relaxed)
    }

    pub fn messages_delivered(&self) -> u64 {
        self.messages_delivered.0.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: SystemTime::now(),
            active_connections: self.active_connections(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.0.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.0.load(Ordering::Relaxed),
            messages_published: self.messages_published(),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered(),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions(),
            topic_count: self.topic_count.load(Ordering::Acquire),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every broker counter
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: SystemTime,
    pub active_connections: usize,
    pub total_connections: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub messages_published: u64,
    pub bytes_published: u64,
    pub messages_delivered: u64,
    pub bytes_delivered: u64,
    pub active_subscriptions: usize,
    pub topic_count: usize,
    pub storage_errors: u64,
    pub protocol_errors: u64,
}

impl MetricsSnapshot {
    /// Export metrics to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_gauge() {
        let metrics = BrokerMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_connections, 2);
    }

    #[test]
    fn test_message_counters() {
        let metrics = BrokerMetrics::new();
        metrics.message_published(10);
        metrics.message_published(5);
        metrics.message_delivered(10);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 2);
        assert_eq!(snapshot.bytes_published, 15);
        assert_eq!(snapshot.messages_delivered, 1);
        assert_eq!(snapshot.bytes_delivered, 10);
    }

    #[test]
    fn test_snapshot_to_json() {
        let metrics = BrokerMetrics::new();
        metrics.update_topic_count(3);
        metrics.storage_error();

        let json = metrics.snapshot().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["topic_count"], 3);
        assert_eq!(value["storage_errors"], 1);
    }
}
