//! Packet deduplication with a bounded sliding window.
//!
//! Capacity-bounded LRU of packet ids with a per-entry TTL. A packet whose
//! id is present and fresh is never delivered upward nor forwarded; expired
//! entries count as unseen.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::protocol::PacketId;

pub struct DedupCache {
    seen: LruCache<PacketId, u64>,
    window_ms: u64,
}

impl DedupCache {
    pub fn new(capacity: usize, window_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            seen: LruCache::new(capacity),
            window_ms,
        }
    }

    /// Record a packet id; returns true when it was already seen inside the
    /// window (a duplicate).
    pub fn check_and_insert(&mut self, packet_id: PacketId, now_ms: u64) -> bool {
        if let Some(&inserted) = self.seen.get(&packet_id) {
            if now_ms.saturating_sub(inserted) <= self.window_ms {
                return true;
            }
        }
        self.seen.put(packet_id, now_ms);
        false
    }

    /// Peek without recording.
    pub fn contains(&mut self, packet_id: &PacketId, now_ms: u64) -> bool {
        match self.seen.get(packet_id) {
            Some(&inserted) => now_ms.saturating_sub(inserted) <= self.window_ms,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
