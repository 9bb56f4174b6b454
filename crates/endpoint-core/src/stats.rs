//! Call counters for the endpoint profile

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct EndpointStats {
    inbound_calls: AtomicU64,
    outbound_calls: AtomicU64,
    inbound_failed: AtomicU64,
    outbound_failed: AtomicU64,
}

/// Point-in-time copy of [`EndpointStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub inbound_calls: u64,
    pub outbound_calls: u64,
    pub inbound_failed: u64,
    pub outbound_failed: u64,
}

impl EndpointStats {
    pub fn record_inbound(&self) {
        self.inbound_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound(&self) {
        self.outbound_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound_failed(&self) {
        self.inbound_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound_failed(&self) {
        self.outbound_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inbound_calls: self.inbound_calls.load(Ordering::Relaxed),
            outbound_calls: self.outbound_calls.load(Ordering::Relaxed),
            inbound_failed: self.inbound_failed.load(Ordering::Relaxed),
            outbound_failed: self.outbound_failed.load(Ordering::Relaxed),
        }
    }
}
