//! Metrics collection for the forwarding daemon.
//!
//! Counters and gauges are plain relaxed atomics so the I/O shell and
//! status reporting can read them without locking the engine. Cloning
//! snapshots the current value.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing event count.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter(AtomicU64::new(self.value()))
    }
}

/// Instantaneous level, such as a table size.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Clone for Gauge {
    fn clone(&self) -> Self {
        Gauge(AtomicU64::new(self.value()))
    }
}

/* ---------------------------------------------------------------- *
 * Aggregate metrics for the daemon
 * ---------------------------------------------------------------- */

#[derive(Debug, Default, Clone)]
pub struct CcndMetrics {
    // Interest path
    pub interests_accepted: Counter,
    pub interests_dropped: Counter,
    pub interests_sent: Counter,
    pub interests_stuffed: Counter,

    // Content path
    pub content_items_received: Counter,
    pub content_items_sent: Counter,
    pub content_dups_received: Counter,

    // Cache
    pub cs_hits: Counter,
    pub cs_misses: Counter,
    pub cs_size: Gauge,

    // Tables
    pub pit_size: Gauge,
    pub nameprefix_count: Gauge,

    // Transport
    pub bytes_received: Counter,
    pub bytes_sent: Counter,
}

impl CcndMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_snapshots() {
        let c = Counter::default();
        c.add(3);
        c.increment();
        let snap = c.clone();
        c.increment();
        assert_eq!(snap.value(), 4);
        assert_eq!(c.value(), 5);

        let g = Gauge::default();
        g.set(9);
        g.decrement();
        g.increment();
        assert_eq!(g.value(), 9);
    }
}
