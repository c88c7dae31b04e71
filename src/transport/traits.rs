//! Transport trait definitions

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::NodeId;
use crate::transport::{ConnectionHandle, TransportKind};

/// Core transport trait - the capability set every concrete link kind
/// implements. Transports surface inbound traffic through the shared
/// [`super::TransportEvent`] channel handed to them at construction.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which link kind this is
    fn kind(&self) -> TransportKind;

    /// Bring the medium up (bind sockets, attach to the bus, start the
    /// radio). Failure means the transport is unavailable and gets omitted
    /// from the pool.
    async fn start(&self) -> Result<()>;

    /// Send a connectionless announcement to whoever is in range.
    async fn announce(&self, frame: Vec<u8>) -> Result<()>;

    /// Open a session to a peer. `endpoint` is the dial string learned from
    /// the peer's announcement. The returned handle is already open.
    async fn dial(&self, peer: NodeId, endpoint: &str) -> Result<ConnectionHandle>;

    /// Stop accepting, close every session, and release the medium.
    async fn shutdown(&self);

    /// Dial string other peers should use to reach this node over this
    /// transport, if the medium needs one.
    fn local_endpoint(&self) -> Option<String>;
}
