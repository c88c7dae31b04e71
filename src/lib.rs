//! meshradio - the mesh engine of an off-grid walkie-talkie application.
//!
//! Nodes discover each other over heterogeneous transports, maintain an
//! adaptively scored routing table, and forward typed packets (voice
//! frames, text, emergency beacons, control traffic) addressed to a channel
//! or a specific peer, with end-to-end encryption between pair-bonded
//! nodes. The UI and audio layers consume this crate through
//! [`node::MeshNode`] and the event bus; platform concerns (clock, RNG,
//! battery, persistence) are injected through [`platform::Platform`].

pub mod channel;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod events;
pub mod mesh;
pub mod node;
pub mod platform;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod status;
pub mod transport;

// Re-export the surface the host applications actually touch.
pub use channel::{Transmission, TransmissionKind};
pub use config::NodeConfig;
pub use error::{Error, Result, SendError};
pub use events::{MeshEvent, SubscriptionToken};
pub use node::{MeshNode, SendOptions};
pub use platform::Platform;
pub use protocol::{NodeId, PacketId};
pub use status::{SignalQuality, Status};
pub use transport::TransportKind;
