//! Core packet types and the stable binary wire format.
//!
//! Everything that crosses a transport is a [`Packet`] framed by
//! [`framing`]: voice and text transmissions, emergency beacons, heartbeat
//! announcements, and the routing control traffic (RREQ/RREP/ACK). The
//! format is little-endian, versioned, and CRC-protected.

pub mod constants;
pub mod framing;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use constants::*;

pub use framing::FrameError;

/// Node identifier - 16 opaque bytes, generated once and persisted by the
/// host. Lexicographic byte order defines tie-breaking.
pub type NodeId = [u8; 16];

/// Packet identifier - 128-bit random id, also the transmission id
pub type PacketId = [u8; 16];

/// The all-zeros broadcast destination
pub const BROADCAST: NodeId = [0u8; 16];

/// Generate a fresh random packet id
pub fn new_packet_id() -> PacketId {
    *uuid::Uuid::new_v4().as_bytes()
}

/// Short hex form of a node id for logs
pub fn short_id(id: &NodeId) -> String {
    hex::encode(&id[..4])
}

/// Packet kinds carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Voice = 0x01,
    Text = 0x02,
    Emergency = 0x03,
    Heartbeat = 0x04,
    RouteRequest = 0x05,
    RouteReply = 0x06,
    Ack = 0x07,
}

impl PacketType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::Voice),
            0x02 => Some(PacketType::Text),
            0x03 => Some(PacketType::Emergency),
            0x04 => Some(PacketType::Heartbeat),
            0x05 => Some(PacketType::RouteRequest),
            0x06 => Some(PacketType::RouteReply),
            0x07 => Some(PacketType::Ack),
            _ => None,
        }
    }

    /// True for application transmissions (voice/text/emergency), false for
    /// control traffic.
    pub fn is_transmission(&self) -> bool {
        matches!(
            self,
            PacketType::Voice | PacketType::Text | PacketType::Emergency
        )
    }
}

/// Capabilities a node advertises in its announcements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Voice,
    Text,
    Emergency,
    Relay,
}

/// A packet as it exists between framing and the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_id: PacketId,
    pub packet_type: PacketType,
    pub priority: u8,
    pub ttl: u8,
    pub source: NodeId,
    pub destination: NodeId,
    pub timestamp_ms: u64,
    pub flags: u8,
    /// Node ids this packet has crossed, oldest first. `route_trace[0]` is
    /// always the source.
    pub route_trace: Vec<NodeId>,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet originating at this node. The trace starts as
    /// `[source]`, keeping the emission invariant by construction.
    pub fn originate(
        source: NodeId,
        destination: NodeId,
        packet_type: PacketType,
        priority: u8,
        ttl: u8,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            packet_id: new_packet_id(),
            packet_type,
            priority: priority.min(PRIORITY_MAX),
            ttl,
            source,
            destination,
            timestamp_ms,
            flags: 0,
            route_trace: vec![source],
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn is_emergency(&self) -> bool {
        self.packet_type == PacketType::Emergency || self.has_flag(FLAG_EMERGENCY)
    }

    /// True if `node` already appears in the trace excluding the final
    /// entry. Used for loop suppression before forwarding.
    pub fn trace_contains_before_last(&self, node: &NodeId) -> bool {
        let len = self.route_trace.len();
        if len == 0 {
            return false;
        }
        self.route_trace[..len - 1].contains(node)
    }

    /// Record a hop: append the crossing node and burn one TTL unit.
    pub fn record_hop(&mut self, node: NodeId) {
        self.route_trace.push(node);
        self.ttl = self.ttl.saturating_sub(1);
    }

    /// Validate the structural invariants a locally emitted packet must
    /// satisfy before it reaches the wire.
    pub fn check_emit_invariants(&self, self_id: &NodeId, max_hops: u8) -> Result<()> {
        if self.source != *self_id || self.route_trace.first() != Some(self_id) {
            return Err(Error::Transport(format!(
                "packet {} does not originate here",
                hex::encode(self.packet_id)
            )));
        }
        let budget = if self.is_emergency() {
            EMERGENCY_TTL
        } else {
            max_hops
        };
        if self.route_trace.len() + self.ttl as usize > budget as usize + 1 {
            return Err(Error::Transport("hop budget exceeded".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn originate_sets_trace_and_source() {
        let src = [7u8; 16];
        let pkt = Packet::originate(src, BROADCAST, PacketType::Text, 5, 5, 1000, vec![1, 2]);
        assert_eq!(pkt.source, src);
        assert_eq!(pkt.route_trace, vec![src]);
        assert!(pkt.is_broadcast());
        assert!(pkt.check_emit_invariants(&src, 5).is_ok());
    }

    #[test]
    fn priority_is_clamped() {
        let pkt = Packet::originate(
            [1u8; 16],
            BROADCAST,
            PacketType::Text,
            200,
            5,
            0,
            Vec::new(),
        );
        assert_eq!(pkt.priority, PRIORITY_MAX);
    }

    #[test]
    fn loop_suppression_ignores_last_entry() {
        let a = [1u8; 16];
        let b = [2u8; 16];
        let mut pkt = Packet::originate(a, BROADCAST, PacketType::Text, 5, 5, 0, Vec::new());
        pkt.record_hop(b);
        // b is the last trace entry: not a loop from b's point of view
        assert!(!pkt.trace_contains_before_last(&b));
        assert!(pkt.trace_contains_before_last(&a));
    }

    #[test]
    fn record_hop_burns_ttl() {
        let mut pkt =
            Packet::originate([1u8; 16], BROADCAST, PacketType::Text, 5, 2, 0, Vec::new());
        pkt.record_hop([2u8; 16]);
        assert_eq!(pkt.ttl, 1);
        pkt.record_hop([3u8; 16]);
        pkt.record_hop([4u8; 16]);
        assert_eq!(pkt.ttl, 0);
    }

    #[test]
    fn emergency_budget_allows_longer_ttl() {
        let src = [9u8; 16];
        let pkt = Packet::originate(
            src,
            BROADCAST,
            PacketType::Emergency,
            10,
            EMERGENCY_TTL,
            0,
            Vec::new(),
        );
        assert!(pkt.check_emit_invariants(&src, 5).is_ok());
    }
}
