//! Transport layer for the meshradio engine.
//!
//! This module implements the transport layer including:
//! - A uniform [`Transport`] trait over heterogeneous links
//! - Direct LAN sessions (TCP) with UDP broadcast announcements
//! - A relay client that bounces through a rendezvous server
//! - A short-range radio wrapper over a host-provided driver
//! - An in-process local bus for co-located instances
//! - Per-peer connection pooling with transport fallback

pub mod connection_pool;
pub mod direct_lan;
pub mod handle;
pub mod local_bus;
pub mod relay;
pub mod short_range;
pub mod traits;

use serde::{Deserialize, Serialize};

use crate::protocol::NodeId;

pub use connection_pool::ConnectionPool;
pub use direct_lan::DirectLanTransport;
pub use handle::{ConnectionHandle, LinkState};
pub use local_bus::LocalBusTransport;
pub use relay::RelayTransport;
pub use short_range::{DriverEvent, ShortRangeDriver, ShortRangeTransport};
pub use traits::Transport;

/// The concrete link kinds a node can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Peer-to-peer TCP session on the local network
    DirectLan,
    /// Bounce through a rendezvous server
    RelayServer,
    /// Low-bandwidth pairing-capable radio
    ShortRange,
    /// Intra-host bus between co-located instances
    LocalBus,
}

impl TransportKind {
    /// Bandwidth estimate used only by the route scorer, in kbps.
    pub fn bandwidth_kbps(&self) -> u32 {
        match self {
            TransportKind::DirectLan => 2_000,
            TransportKind::RelayServer => 1_000,
            TransportKind::ShortRange => 100,
            TransportKind::LocalBus => 10_000,
        }
    }

    /// Default signal strength attributed to links of this kind when the
    /// medium reports nothing better.
    pub fn default_signal(&self) -> u8 {
        match self {
            TransportKind::DirectLan => 90,
            TransportKind::RelayServer => 70,
            TransportKind::ShortRange => 50,
            TransportKind::LocalBus => 100,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::DirectLan => "direct-lan",
            TransportKind::RelayServer => "relay",
            TransportKind::ShortRange => "short-range",
            TransportKind::LocalBus => "local-bus",
        };
        write!(f, "{}", name)
    }
}

/// Events a transport surfaces to the engine
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An inbound session opened (dialed sessions are returned from `dial`
    /// instead).
    Connected { handle: ConnectionHandle },
    Disconnected {
        peer: NodeId,
        kind: TransportKind,
        reason: String,
    },
    /// A framed packet arrived over an open session
    FrameReceived {
        peer: NodeId,
        kind: TransportKind,
        signal_strength: u8,
        bytes: Vec<u8>,
    },
    /// A connectionless announcement arrived. `origin` is the medium-level
    /// source (e.g. the UDP address) when the medium exposes one.
    AnnounceReceived {
        kind: TransportKind,
        signal_strength: u8,
        origin: Option<String>,
        bytes: Vec<u8>,
    },
    Error {
        peer: Option<NodeId>,
        kind: TransportKind,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_hints_order() {
        assert!(
            TransportKind::LocalBus.bandwidth_kbps() > TransportKind::DirectLan.bandwidth_kbps()
        );
        assert!(
            TransportKind::DirectLan.bandwidth_kbps()
                > TransportKind::RelayServer.bandwidth_kbps()
        );
        assert!(
            TransportKind::RelayServer.bandwidth_kbps()
                > TransportKind::ShortRange.bandwidth_kbps()
        );
    }
}
