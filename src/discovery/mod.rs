//! Peer discovery: announcements and the peer directory.
//!
//! While powered on, a node broadcasts an [`Announce`] every 30 seconds on
//! every available transport, carried as the payload of a TTL-1 heartbeat
//! packet. Received announcements create or refresh directory entries and a
//! 1-hop route; peers silent past the stale window are swept out.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{Capability, NodeId, Packet, PacketType};
use crate::transport::TransportKind;

/// Announcement payload carried in heartbeat packets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub node_id: NodeId,
    pub display_name: String,
    pub capabilities: Vec<Capability>,
    pub battery_percent: u8,
    pub monotonic_ms: u64,
    /// Dial strings per transport this node listens on
    pub endpoints: Vec<(TransportKind, String)>,
}

impl Announce {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Wrap into the TTL-1 heartbeat packet put on the wire.
    pub fn into_packet(self, now_ms: u64) -> Result<Packet> {
        let node_id = self.node_id;
        let payload = self.encode()?;
        Ok(Packet::originate(
            node_id,
            crate::protocol::BROADCAST,
            PacketType::Heartbeat,
            0,
            1,
            now_ms,
            payload,
        ))
    }
}

/// Directory entry for a known peer
#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: NodeId,
    pub display_name: String,
    pub capabilities: Vec<Capability>,
    pub battery_percent: u8,
    pub last_seen_ms: u64,
    pub signal_strength: u8,
    pub best_transport: TransportKind,
    pub is_reachable: bool,
    pub endpoints: Vec<(TransportKind, String)>,
}

/// What an announcement did to the directory
#[derive(Debug, Clone)]
pub enum PeerChange {
    Discovered(Peer),
    Updated(Peer),
}

/// Directory of every peer this node has heard from recently
pub struct PeerDirectory {
    peers: RwLock<HashMap<NodeId, Peer>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh a peer from a received announcement. For
    /// DirectLan, the dial endpoint combines the advertised port with the
    /// announce datagram's origin address.
    pub fn upsert_from_announce(
        &self,
        announce: Announce,
        inbound: TransportKind,
        signal_strength: u8,
        origin: Option<&str>,
        now_ms: u64,
    ) -> PeerChange {
        let mut endpoints = announce.endpoints;
        if let (TransportKind::DirectLan, Some(ip)) = (inbound, origin) {
            for (kind, endpoint) in endpoints.iter_mut() {
                if *kind == TransportKind::DirectLan && !endpoint.contains(':') {
                    *endpoint = format!("{}:{}", ip, endpoint);
                }
            }
        }

        let mut peers = self.peers.write();
        match peers.get_mut(&announce.node_id) {
            Some(peer) => {
                peer.display_name = announce.display_name;
                peer.capabilities = announce.capabilities;
                peer.battery_percent = announce.battery_percent;
                peer.last_seen_ms = now_ms;
                peer.signal_strength = signal_strength;
                peer.is_reachable = true;
                if signal_strength >= peer.signal_strength
                    || inbound.bandwidth_kbps() > peer.best_transport.bandwidth_kbps()
                {
                    peer.best_transport = inbound;
                }
                for (kind, endpoint) in endpoints {
                    match peer.endpoints.iter_mut().find(|(k, _)| *k == kind) {
                        Some(existing) => existing.1 = endpoint,
                        None => peer.endpoints.push((kind, endpoint)),
                    }
                }
                PeerChange::Updated(peer.clone())
            }
            None => {
                let peer = Peer {
                    node_id: announce.node_id,
                    display_name: announce.display_name,
                    capabilities: announce.capabilities,
                    battery_percent: announce.battery_percent,
                    last_seen_ms: now_ms,
                    signal_strength,
                    best_transport: inbound,
                    is_reachable: true,
                    endpoints,
                };
                peers.insert(peer.node_id, peer.clone());
                PeerChange::Discovered(peer)
            }
        }
    }

    /// Refresh activity on any received packet; unknown peers are left for
    /// their next announcement.
    pub fn touch(&self, node_id: &NodeId, now_ms: u64) {
        if let Some(peer) = self.peers.write().get_mut(node_id) {
            peer.last_seen_ms = now_ms;
            peer.is_reachable = true;
        }
    }

    pub fn mark_unreachable(&self, node_id: &NodeId) {
        if let Some(peer) = self.peers.write().get_mut(node_id) {
            peer.is_reachable = false;
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Peer> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn list(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    /// Dial endpoints for a peer, preferred kind first.
    pub fn dial_plan(
        &self,
        node_id: &NodeId,
        preferred: Option<TransportKind>,
    ) -> Vec<(TransportKind, String)> {
        let peers = self.peers.read();
        let Some(peer) = peers.get(node_id) else {
            return Vec::new();
        };
        let mut plan = peer.endpoints.clone();
        plan.sort_by(|(a, _), (b, _)| {
            let a_pref = Some(*a) == preferred;
            let b_pref = Some(*b) == preferred;
            b_pref
                .cmp(&a_pref)
                .then_with(|| b.bandwidth_kbps().cmp(&a.bandwidth_kbps()))
        });
        plan
    }

    /// Evict peers silent past the stale window; returns the evicted ids.
    pub fn sweep_stale(&self, now_ms: u64, stale_ms: u64) -> Vec<NodeId> {
        let mut peers = self.peers.write();
        let stale: Vec<NodeId> = peers
            .values()
            .filter(|p| now_ms.saturating_sub(p.last_seen_ms) > stale_ms)
            .map(|p| p.node_id)
            .collect();
        for node_id in &stale {
            peers.remove(node_id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Peers with activity inside the window (for the status snapshot).
    pub fn active_count(&self, now_ms: u64, window_ms: u64) -> usize {
        self.peers
            .read()
            .values()
            .filter(|p| now_ms.saturating_sub(p.last_seen_ms) <= window_ms)
            .count()
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(id: u8, ms: u64) -> Announce {
        Announce {
            node_id: [id; 16],
            display_name: format!("node-{}", id),
            capabilities: vec![Capability::Text],
            battery_percent: 80,
            monotonic_ms: ms,
            endpoints: vec![(TransportKind::DirectLan, "47474".into())],
        }
    }

    #[test]
    fn announce_roundtrip_through_packet() {
        let packet = announce(1, 500).into_packet(500).unwrap();
        assert_eq!(packet.packet_type, PacketType::Heartbeat);
        assert_eq!(packet.ttl, 1);
        let decoded = Announce::decode(&packet.payload).unwrap();
        assert_eq!(decoded.node_id, [1u8; 16]);
        assert_eq!(decoded.display_name, "node-1");
    }

    #[test]
    fn first_announce_discovers_then_updates() {
        let directory = PeerDirectory::new();
        let change =
            directory.upsert_from_announce(announce(1, 0), TransportKind::LocalBus, 100, None, 10);
        assert!(matches!(change, PeerChange::Discovered(_)));
        let change =
            directory.upsert_from_announce(announce(1, 5), TransportKind::LocalBus, 100, None, 20);
        assert!(matches!(change, PeerChange::Updated(_)));
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.get(&[1u8; 16]).unwrap().last_seen_ms, 20);
    }

    #[test]
    fn direct_lan_endpoint_learns_origin_ip() {
        let directory = PeerDirectory::new();
        directory.upsert_from_announce(
            announce(1, 0),
            TransportKind::DirectLan,
            90,
            Some("192.168.1.7"),
            0,
        );
        let plan = directory.dial_plan(&[1u8; 16], None);
        assert_eq!(plan[0].1, "192.168.1.7:47474");
    }

    #[test]
    fn stale_sweep_evicts_silent_peers() {
        let directory = PeerDirectory::new();
        directory.upsert_from_announce(announce(1, 0), TransportKind::LocalBus, 100, None, 0);
        directory.upsert_from_announce(announce(2, 0), TransportKind::LocalBus, 100, None, 100_000);
        let evicted = directory.sweep_stale(125_000, 120_000);
        assert_eq!(evicted, vec![[1u8; 16]]);
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn dial_plan_prefers_requested_kind() {
        let directory = PeerDirectory::new();
        let mut a = announce(1, 0);
        a.endpoints = vec![
            (TransportKind::ShortRange, "radio".into()),
            (TransportKind::LocalBus, "default".into()),
        ];
        directory.upsert_from_announce(a, TransportKind::LocalBus, 100, None, 0);
        let plan = directory.dial_plan(&[1u8; 16], Some(TransportKind::ShortRange));
        assert_eq!(plan[0].0, TransportKind::ShortRange);
        // without a preference the faster medium wins
        let plan = directory.dial_plan(&[1u8; 16], None);
        assert_eq!(plan[0].0, TransportKind::LocalBus);
    }
}
