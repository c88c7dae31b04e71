//! Per-peer connection pooling across transports.
//!
//! The pool owns every [`ConnectionHandle`] in the engine. Policy: reuse an
//! open handle when one exists, otherwise dial along the caller's
//! transport-preference order with a per-transport timeout; keep at most
//! two handles per peer and `max_connections` overall, evicting the
//! least-recently-used idle handle when full.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::platform::Clock;
use crate::protocol::{short_id, NodeId};

use super::{ConnectionHandle, LinkState, Transport, TransportKind};

/// Open handles kept per peer
pub const HANDLES_PER_PEER: usize = 2;

pub struct ConnectionPool {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    handles: DashMap<NodeId, Vec<ConnectionHandle>>,
    clock: Arc<dyn Clock>,
    max_connections: usize,
    dial_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(
        transports: HashMap<TransportKind, Arc<dyn Transport>>,
        clock: Arc<dyn Clock>,
        max_connections: usize,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            transports,
            handles: DashMap::new(),
            clock,
            max_connections,
            dial_timeout,
        }
    }

    pub fn transport(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.transports.get(&kind).cloned()
    }

    pub fn transports(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.values()
    }

    pub fn available_kinds(&self) -> Vec<TransportKind> {
        self.transports.keys().copied().collect()
    }

    /// Track a handle (inbound session or successful dial).
    pub fn register(&self, handle: ConnectionHandle) {
        let now = self.clock.now_ms();
        handle.touch(now);

        {
            let mut entry = self.handles.entry(handle.peer()).or_default();
            entry.retain(|h| h.state() != LinkState::Closed);
            // Replace a same-kind handle rather than stacking duplicates.
            if let Some(existing) = entry.iter().position(|h| h.kind() == handle.kind()) {
                entry[existing].close();
                entry.remove(existing);
            }
            while entry.len() >= HANDLES_PER_PEER {
                let lru = entry
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, h)| h.last_used_ms())
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                entry[lru].close();
                entry.remove(lru);
            }
            entry.push(handle);
        }

        self.enforce_global_cap();
    }

    fn enforce_global_cap(&self) {
        loop {
            let total: usize = self
                .handles
                .iter()
                .map(|entry| {
                    entry
                        .value()
                        .iter()
                        .filter(|h| h.state() != LinkState::Closed)
                        .count()
                })
                .sum();
            if total <= self.max_connections {
                break;
            }
            // Evict the least-recently-used idle handle anywhere.
            let mut victim: Option<(NodeId, usize, u64)> = None;
            for entry in self.handles.iter() {
                for (i, handle) in entry.value().iter().enumerate() {
                    if handle.state() != LinkState::Open {
                        continue;
                    }
                    let used = handle.last_used_ms();
                    if victim.map_or(true, |(_, _, best)| used < best) {
                        victim = Some((*entry.key(), i, used));
                    }
                }
            }
            match victim {
                Some((peer, index, _)) => {
                    if let Some(mut entry) = self.handles.get_mut(&peer) {
                        if index < entry.len() {
                            entry[index].close();
                            entry.remove(index);
                        }
                    }
                }
                None => break,
            }
        }
    }

    /// Best open handle for a peer, if any. `preference` orders transport
    /// kinds best-first; handles outside the list still qualify last.
    pub fn handle_for(&self, peer: &NodeId, preference: &[TransportKind]) -> Option<ConnectionHandle> {
        let entry = self.handles.get(peer)?;
        let open: Vec<&ConnectionHandle> =
            entry.value().iter().filter(|h| h.is_open()).collect();
        if open.is_empty() {
            return None;
        }
        for kind in preference {
            if let Some(handle) = open.iter().find(|h| h.kind() == *kind) {
                return Some((*handle).clone());
            }
        }
        Some(open[0].clone())
    }

    /// Acquire a handle for `peer`: reuse an open one, else dial along
    /// `dial_plan` (transport kind plus endpoint, best first).
    pub async fn acquire(
        &self,
        peer: NodeId,
        dial_plan: &[(TransportKind, String)],
    ) -> Result<ConnectionHandle> {
        let preference: Vec<TransportKind> = dial_plan.iter().map(|(k, _)| *k).collect();
        if let Some(handle) = self.handle_for(&peer, &preference) {
            handle.touch(self.clock.now_ms());
            return Ok(handle);
        }

        for (kind, endpoint) in dial_plan {
            let transport = match self.transports.get(kind) {
                Some(transport) => transport.clone(),
                None => continue,
            };
            match timeout(self.dial_timeout, transport.dial(peer, endpoint)).await {
                Ok(Ok(handle)) => {
                    self.register(handle.clone());
                    return Ok(handle);
                }
                Ok(Err(e)) => {
                    log::debug!("dial {} over {} failed: {}", short_id(&peer), kind, e);
                }
                Err(_) => {
                    log::debug!(
                        "dial {} over {} timed out after {:?}",
                        short_id(&peer),
                        kind,
                        self.dial_timeout
                    );
                }
            }
        }

        Err(Error::DialFailed(format!(
            "no transport reached {}",
            short_id(&peer)
        )))
    }

    /// All open handles (for broadcast fan-out).
    pub fn open_handles(&self) -> Vec<ConnectionHandle> {
        let mut open = Vec::new();
        for entry in self.handles.iter() {
            for handle in entry.value() {
                if handle.is_open() {
                    open.push(handle.clone());
                }
            }
        }
        open
    }

    /// Receive-side failure: drain then close the affected handle. The
    /// caller decrements route reliability separately.
    pub fn on_link_error(&self, peer: &NodeId, kind: TransportKind) {
        if let Some(mut entry) = self.handles.get_mut(peer) {
            for handle in entry.iter() {
                if handle.kind() == kind {
                    handle.mark_draining();
                    handle.close();
                }
            }
            entry.retain(|h| h.state() != LinkState::Closed);
        }
    }

    /// Drop closed handles everywhere.
    pub fn prune(&self) {
        self.handles
            .retain(|_, entry| {
                entry.retain(|h| h.state() != LinkState::Closed);
                !entry.is_empty()
            });
    }

    pub fn active_count(&self) -> usize {
        self.handles
            .iter()
            .map(|entry| entry.value().iter().filter(|h| h.is_open()).count())
            .sum()
    }

    pub fn close_all(&self) {
        for entry in self.handles.iter() {
            for handle in entry.value() {
                handle.close();
            }
        }
        self.handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MonotonicClock;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(
            HashMap::new(),
            Arc::new(MonotonicClock::new()),
            4,
            Duration::from_secs(1),
        )
    }

    fn open_handle(peer: u8, kind: TransportKind) -> ConnectionHandle {
        // The writer receiver is dropped; pool bookkeeping only looks at
        // state and last_used.
        let (handle, _rx) = ConnectionHandle::channel([peer; 16], kind);
        handle.mark_open();
        handle
    }

    #[test]
    fn per_peer_cap_enforced() {
        let pool = pool();
        pool.register(open_handle(1, TransportKind::LocalBus));
        pool.register(open_handle(1, TransportKind::DirectLan));
        pool.register(open_handle(1, TransportKind::RelayServer));
        let entry = pool.handles.get(&[1u8; 16]).unwrap();
        assert_eq!(entry.len(), HANDLES_PER_PEER);
    }

    #[test]
    fn same_kind_replaces() {
        let pool = pool();
        pool.register(open_handle(1, TransportKind::LocalBus));
        pool.register(open_handle(1, TransportKind::LocalBus));
        let entry = pool.handles.get(&[1u8; 16]).unwrap();
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn global_cap_evicts_lru() {
        let pool = pool();
        for peer in 1..=5u8 {
            pool.register(open_handle(peer, TransportKind::LocalBus));
        }
        assert!(pool.active_count() <= 4);
    }

    #[test]
    fn preference_order_wins() {
        let pool = pool();
        pool.register(open_handle(1, TransportKind::RelayServer));
        pool.register(open_handle(1, TransportKind::DirectLan));
        let preferred = pool
            .handle_for(&[1u8; 16], &[TransportKind::DirectLan])
            .unwrap();
        assert_eq!(preferred.kind(), TransportKind::DirectLan);
    }

    #[tokio::test]
    async fn acquire_without_routes_fails() {
        let pool = pool();
        let result = pool.acquire([9u8; 16], &[]).await;
        assert!(matches!(result, Err(Error::DialFailed(_))));
    }
}
