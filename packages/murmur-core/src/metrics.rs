//! Packet-path counters.
//!
//! The router and multiplexer bump these on every drop decision; the
//! boundary exposes a snapshot. Counters only ever increase.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for the packet processing path.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Packets dropped because the bloom filter had already seen them
    pub dropped_duplicate: AtomicU64,
    /// Packets dropped because TTL was exhausted before relay
    pub dropped_expired_ttl: AtomicU64,
    /// Packets dropped for excessive clock skew
    pub dropped_stale_timestamp: AtomicU64,
    /// Packets dropped because decode failed
    pub codec_failures: AtomicU64,
    /// Packets relayed onward into the mesh
    pub relayed: AtomicU64,
    /// Fragmented messages discarded after the reassembly window
    pub reassembly_timeouts: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub dropped_duplicate: u64,
    pub dropped_expired_ttl: u64,
    pub dropped_stale_timestamp: u64,
    pub codec_failures: u64,
    pub relayed: u64,
    pub reassembly_timeouts: u64,
}

impl Metrics {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_expired_ttl: self.dropped_expired_ttl.load(Ordering::Relaxed),
            dropped_stale_timestamp: self.dropped_stale_timestamp.load(Ordering::Relaxed),
            codec_failures: self.codec_failures.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            reassembly_timeouts: self.reassembly_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Bump a counter by one.
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let m = Metrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.dropped_duplicate, 0);
        assert_eq!(snap.relayed, 0);
    }

    #[test]
    fn test_bump_increments() {
        let m = Metrics::new();
        bump(&m.dropped_duplicate);
        bump(&m.dropped_duplicate);
        bump(&m.relayed);
        let snap = m.snapshot();
        assert_eq!(snap.dropped_duplicate, 2);
        assert_eq!(snap.relayed, 1);
    }
}
