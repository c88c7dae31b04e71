//! Status snapshot and rolling engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Coarse link quality bucket shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalQuality {
    None,
    Poor,
    Good,
    Excellent,
}

/// Bucket from active peer count and mean route reliability.
pub fn signal_quality(active_peers: usize, reliability: f64) -> SignalQuality {
    if active_peers >= 3 && reliability >= 90.0 {
        SignalQuality::Excellent
    } else if active_peers >= 2 && reliability >= 75.0 {
        SignalQuality::Good
    } else if active_peers >= 1 && reliability >= 50.0 {
        SignalQuality::Poor
    } else {
        SignalQuality::None
    }
}

/// Rolling counters bumped all over the engine
#[derive(Debug, Default)]
pub struct Counters {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_forwarded: AtomicU64,
    pub packets_delivered: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub framing_errors: AtomicU64,
    pub auth_failures: AtomicU64,
    pub announces_sent: AtomicU64,
    pub no_route_failures: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            packets_delivered: self.packets_delivered.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            announces_sent: self.announces_sent.load(Ordering::Relaxed),
            no_route_failures: self.no_route_failures.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`Counters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_forwarded: u64,
    pub packets_delivered: u64,
    pub packets_dropped: u64,
    pub duplicates_dropped: u64,
    pub framing_errors: u64,
    pub auth_failures: u64,
    pub announces_sent: u64,
    pub no_route_failures: u64,
}

/// Engine status pushed to subscribers (at most once per five seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub battery_percent: u8,
    pub online: bool,
    pub signal_quality: SignalQuality,
    pub peer_count: usize,
    pub active_peer_count: usize,
    pub avg_latency_ms: f64,
    pub reliability: f64,
    pub transports_available: Vec<TransportKind>,
    pub counters: CounterSnapshot,
}

impl Status {
    pub fn offline(battery_percent: u8) -> Self {
        Self {
            battery_percent,
            online: false,
            signal_quality: SignalQuality::None,
            peer_count: 0,
            active_peer_count: 0,
            avg_latency_ms: 0.0,
            reliability: 0.0,
            transports_available: Vec::new(),
            counters: CounterSnapshot::default(),
        }
    }
}
