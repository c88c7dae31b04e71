//! On-demand route discovery control payloads.
//!
//! RREQ rides a broadcast packet whose id doubles as the request id (the
//! shared dedup cache suppresses re-floods); RREP travels back unicast
//! along the reverse path installed while the request crossed the mesh.
//! Both carry the same tiny payload: the routable target plus a hop count.

use std::io::{Cursor, Read};

use crate::protocol::NodeId;

/// Payload of RREQ and RREP packets: `target:16 | hop_count:1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePayload {
    pub target: NodeId,
    pub hop_count: u8,
}

impl RoutePayload {
    pub fn new(target: NodeId, hop_count: u8) -> Self {
        Self { target, hop_count }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        buf.extend_from_slice(&self.target);
        buf.push(self.hop_count);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut target: NodeId = [0u8; 16];
        cursor.read_exact(&mut target).ok()?;
        let mut hop = [0u8; 1];
        cursor.read_exact(&mut hop).ok()?;
        if cursor.position() as usize != bytes.len() {
            return None;
        }
        Some(Self {
            target,
            hop_count: hop[0],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let payload = RoutePayload::new([7u8; 16], 3);
        let decoded = RoutePayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn rejects_malformed() {
        assert!(RoutePayload::decode(&[]).is_none());
        assert!(RoutePayload::decode(&[0u8; 16]).is_none());
        assert!(RoutePayload::decode(&[0u8; 18]).is_none());
    }
}
