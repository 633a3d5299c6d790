//! Receiver-wide health counters
//!
//! Session-independent accounting for the receive loop: datagrams that never
//! reach a session (malformed, unattributed, spoofed source) and aggregate
//! traffic totals. All fields are atomics so the receive task, the tick task
//! and any observer can touch them without coordination.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared across all sessions
#[derive(Debug, Default)]
pub struct ReceiverHealth {
    /// Datagrams that failed wire parsing
    pub malformed: AtomicU64,

    /// Valid packets naming a session the registry does not know
    pub unattributed: AtomicU64,

    /// Packets whose source address did not match the registered endpoint
    pub endpoint_mismatch: AtomicU64,

    /// Packets accepted and dispatched into a session pipeline
    pub packets_accepted: AtomicU64,

    /// Payload bytes accepted
    pub bytes_accepted: AtomicU64,

    /// Chunks refused because a memory cap was hit
    pub memory_pressure: AtomicU64,

    /// Socket receive errors reported upward
    pub socket_errors: AtomicU64,
}

impl ReceiverHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unattributed(&self) {
        self.unattributed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_mismatch(&self) {
        self.endpoint_mismatch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self, payload_bytes: usize) {
        self.packets_accepted.fetch_add(1, Ordering::Relaxed);
        self.bytes_accepted
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    pub fn record_memory_pressure(&self) {
        self.memory_pressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot for logging
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            packets_accepted: self.packets_accepted.load(Ordering::Relaxed),
            bytes_accepted: self.bytes_accepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unattributed: self.unattributed.load(Ordering::Relaxed),
            endpoint_mismatch: self.endpoint_mismatch.load(Ordering::Relaxed),
            memory_pressure: self.memory_pressure.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ReceiverHealth`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSummary {
    pub packets_accepted: u64,
    pub bytes_accepted: u64,
    pub malformed: u64,
    pub unattributed: u64,
    pub endpoint_mismatch: u64,
    pub memory_pressure: u64,
    pub socket_errors: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} packets ({} bytes), {} malformed, {} unattributed, {} endpoint mismatches, {} memory refusals, {} socket errors",
            self.packets_accepted,
            self.bytes_accepted,
            self.malformed,
            self.unattributed,
            self.endpoint_mismatch,
            self.memory_pressure,
            self.socket_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let health = ReceiverHealth::new();
        health.record_accepted(100);
        health.record_accepted(250);
        health.record_malformed();
        health.record_unattributed();
        health.record_endpoint_mismatch();

        let s = health.summary();
        assert_eq!(s.packets_accepted, 2);
        assert_eq!(s.bytes_accepted, 350);
        assert_eq!(s.malformed, 1);
        assert_eq!(s.unattributed, 1);
        assert_eq!(s.endpoint_mismatch, 1);
        assert_eq!(s.memory_pressure, 0);
    }
}
