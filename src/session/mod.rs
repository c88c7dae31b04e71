//! Pair store: pending and verified bonds.
//!
//! Writes are rare (pairing is a human-paced flow), so a single
//! read-write lock guards the whole map. Unverified records are
//! garbage-collected after five minutes by the engine maintenance task;
//! verified records persist until `rotate_keys` or explicit removal.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use zeroize::Zeroize;

use crate::crypto::SESSION_KEY_LEN;
use crate::error::{Error, Result};
use crate::protocol::{short_id, NodeId};

/// Unverified bonds older than this get collected
pub const UNVERIFIED_TTL_MS: u64 = 5 * 60 * 1000;

/// One bond with a peer
#[derive(Clone)]
pub struct PairingRecord {
    pub peer_id: NodeId,
    pub their_public_key: [u8; 32],
    pub session_key: [u8; SESSION_KEY_LEN],
    pub verified: bool,
    pub created_ms: u64,
}

impl fmt::Debug for PairingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingRecord")
            .field("peer_id", &short_id(&self.peer_id))
            .field("verified", &self.verified)
            .field("created_ms", &self.created_ms)
            .finish_non_exhaustive()
    }
}

impl Drop for PairingRecord {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

/// Thread-safe store of pairing records keyed by peer id
pub struct PairStore {
    records: RwLock<HashMap<NodeId, PairingRecord>>,
}

impl PairStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a pending (unverified) bond.
    pub fn insert_pending(&self, record: PairingRecord) {
        self.records.write().insert(record.peer_id, record);
    }

    pub fn get(&self, peer_id: &NodeId) -> Option<PairingRecord> {
        self.records.read().get(peer_id).cloned()
    }

    /// Session key for a verified bond; `NotPaired` otherwise.
    pub fn verified_session_key(&self, peer_id: &NodeId) -> Result<[u8; SESSION_KEY_LEN]> {
        match self.records.read().get(peer_id) {
            Some(record) if record.verified => Ok(record.session_key),
            _ => Err(Error::NotPaired),
        }
    }

    /// Flip a pending bond to verified; returns the updated record.
    pub fn mark_verified(&self, peer_id: &NodeId) -> Option<PairingRecord> {
        let mut records = self.records.write();
        let record = records.get_mut(peer_id)?;
        record.verified = true;
        Some(record.clone())
    }

    /// UI-facing view: verified bonds only.
    pub fn list_verified(&self) -> Vec<PairingRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.verified)
            .cloned()
            .collect()
    }

    pub fn verified_peers(&self) -> Vec<NodeId> {
        self.records
            .read()
            .values()
            .filter(|r| r.verified)
            .map(|r| r.peer_id)
            .collect()
    }

    pub fn remove(&self, peer_id: &NodeId) -> bool {
        self.records.write().remove(peer_id).is_some()
    }

    /// Drop every bond. Used by `rotate_keys`.
    pub fn clear(&self) {
        self.records.write().clear();
    }

    /// Collect unverified bonds past their window; returns the evicted
    /// peer ids.
    pub fn gc_unverified(&self, now_ms: u64) -> Vec<NodeId> {
        let mut records = self.records.write();
        let expired: Vec<NodeId> = records
            .values()
            .filter(|r| !r.verified && now_ms.saturating_sub(r.created_ms) > UNVERIFIED_TTL_MS)
            .map(|r| r.peer_id)
            .collect();
        for peer_id in &expired {
            records.remove(peer_id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for PairStore {
    fn default() -> Self {
        Self::new()
    }
}
