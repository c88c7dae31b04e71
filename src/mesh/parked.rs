//! Store-and-forward queue.
//!
//! Packets with no usable route are parked here and retried when a route
//! installs, a link opens, or (for emergencies) every ten seconds. Text
//! parks for at most a day, voice for two hours, emergencies until
//! delivered.

use crate::error::{Error, Result};
use crate::protocol::{NodeId, Packet, PacketType};

const TEXT_PARK_MS: u64 = 24 * 60 * 60 * 1000;
const VOICE_PARK_MS: u64 = 2 * 60 * 60 * 1000;

/// Retry cadence for parked emergency packets
pub const EMERGENCY_RETRY_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ParkedPacket {
    pub packet: Packet,
    pub parked_ms: u64,
    pub expires_ms: Option<u64>,
    pub last_attempt_ms: u64,
}

pub struct ParkedQueue {
    entries: Vec<ParkedPacket>,
    capacity: usize,
}

impl ParkedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Park a packet. When full, expired entries are collected first; an
    /// emergency may additionally evict the oldest non-emergency entry.
    pub fn park(&mut self, packet: Packet, now_ms: u64) -> Result<()> {
        if self.entries.len() >= self.capacity {
            self.sweep_expired(now_ms);
        }
        if self.entries.len() >= self.capacity {
            if packet.is_emergency() {
                if let Some(victim) = self
                    .entries
                    .iter()
                    .position(|e| !e.packet.is_emergency())
                {
                    self.entries.remove(victim);
                } else {
                    return Err(Error::ParkedFull);
                }
            } else {
                return Err(Error::ParkedFull);
            }
        }

        let expires_ms = match packet.packet_type {
            PacketType::Text => Some(now_ms + TEXT_PARK_MS),
            PacketType::Voice => Some(now_ms + VOICE_PARK_MS),
            PacketType::Emergency => None,
            _ => Some(now_ms + TEXT_PARK_MS),
        };
        self.entries.push(ParkedPacket {
            packet,
            parked_ms: now_ms,
            expires_ms,
            last_attempt_ms: now_ms,
        });
        Ok(())
    }

    /// Pull every live entry that `matches`; matched entries leave the
    /// queue (re-parked by the caller if delivery fails again).
    pub fn take_matching<F>(&mut self, now_ms: u64, mut matches: F) -> Vec<ParkedPacket>
    where
        F: FnMut(&ParkedPacket) -> bool,
    {
        self.sweep_expired(now_ms);
        let mut taken = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if matches(&self.entries[index]) {
                taken.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }
        taken
    }

    /// Entries destined to `destination` (or broadcasts when it is the
    /// broadcast id).
    pub fn take_for(&mut self, destination: &NodeId, now_ms: u64) -> Vec<ParkedPacket> {
        self.take_matching(now_ms, |entry| entry.packet.destination == *destination)
    }

    /// Parked emergencies past their retry interval.
    pub fn take_emergencies_due(&mut self, now_ms: u64) -> Vec<ParkedPacket> {
        self.take_matching(now_ms, |entry| {
            entry.packet.is_emergency()
                && now_ms.saturating_sub(entry.last_attempt_ms) >= EMERGENCY_RETRY_MS
        })
    }

    /// Put an entry back after a failed retry, refreshing its attempt
    /// stamp but keeping the original park time and expiry.
    pub fn repark(&mut self, mut entry: ParkedPacket, now_ms: u64) {
        entry.last_attempt_ms = now_ms;
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
        }
    }

    /// Drop expired entries; returns how many died.
    pub fn sweep_expired(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.expires_ms.map_or(true, |expiry| expiry > now_ms));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
