//! Engine configuration.
//!
//! The host supplies a [`NodeConfig`] at start-up; everything has a spec
//! default, and the CLI binary can layer `MESHRADIO_*` environment
//! overrides on top.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::constants::{DEFAULT_MAX_HOPS, MAX_HOPS_LIMIT, MAX_PAYLOAD};
use crate::protocol::{Capability, NodeId};
use crate::transport::TransportKind;

/// Configuration for a mesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Fixed node id; generated and persisted through the blob store when
    /// absent.
    pub node_id: Option<NodeId>,
    /// Name shown to other peers in announcements
    pub display_name: String,
    /// Capabilities advertised in announcements
    pub capabilities: Vec<Capability>,
    pub announce_interval: Duration,
    pub stale_peer: Duration,
    pub route_stale: Duration,
    pub max_hops: u8,
    pub max_payload_bytes: usize,
    pub dedup_window: Duration,
    pub dedup_capacity: usize,
    pub max_connections: usize,
    pub parked_capacity: usize,
    /// Transports the host wants enabled; availability is still checked at
    /// power-on.
    pub transports_enabled: Vec<TransportKind>,
    /// TCP/UDP port for the DirectLan transport
    pub lan_port: u16,
    /// Rendezvous server for the RelayServer transport
    pub relay_endpoint: Option<String>,
    /// Bus name joined by the LocalBus transport
    pub local_bus_name: String,
    pub dial_timeout: Duration,
    pub discovery_timeout: Duration,
    pub drain_timeout: Duration,
    pub status_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            display_name: String::from("meshradio-node"),
            capabilities: vec![Capability::Voice, Capability::Text, Capability::Emergency],
            announce_interval: Duration::from_secs(30),
            stale_peer: Duration::from_secs(120),
            route_stale: Duration::from_secs(300),
            max_hops: DEFAULT_MAX_HOPS,
            max_payload_bytes: MAX_PAYLOAD,
            dedup_window: Duration::from_secs(300),
            dedup_capacity: 4096,
            max_connections: 64,
            parked_capacity: 512,
            transports_enabled: vec![
                TransportKind::DirectLan,
                TransportKind::RelayServer,
                TransportKind::ShortRange,
                TransportKind::LocalBus,
            ],
            lan_port: 47474,
            relay_endpoint: None,
            local_bus_name: String::from("default"),
            dial_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(2),
            status_interval: Duration::from_secs(5),
        }
    }
}

impl NodeConfig {
    /// Clamp and sanity-check host-supplied values.
    pub fn validate(mut self) -> Result<Self> {
        self.max_hops = self.max_hops.clamp(1, MAX_HOPS_LIMIT);
        if self.max_payload_bytes > MAX_PAYLOAD {
            return Err(Error::Config(format!(
                "max_payload_bytes {} exceeds wire limit {}",
                self.max_payload_bytes, MAX_PAYLOAD
            )));
        }
        if self.dedup_capacity == 0 {
            return Err(Error::Config("dedup_capacity must be nonzero".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be nonzero".into()));
        }
        if self
            .transports_enabled
            .contains(&TransportKind::RelayServer)
            && self.relay_endpoint.is_none()
        {
            // Relay without an endpoint just ends up unavailable.
            self.transports_enabled
                .retain(|kind| *kind != TransportKind::RelayServer);
        }
        Ok(self)
    }

    /// Layer `MESHRADIO_*` environment overrides over this configuration.
    pub fn from_env() -> Self {
        use std::env;

        let mut config = Self::default();

        if let Ok(name) = env::var("MESHRADIO_DISPLAY_NAME") {
            config.display_name = name;
        }
        if let Ok(port) = env::var("MESHRADIO_LAN_PORT") {
            if let Ok(port) = port.parse() {
                config.lan_port = port;
            }
        }
        if let Ok(relay) = env::var("MESHRADIO_RELAY") {
            config.relay_endpoint = Some(relay);
        }
        if let Ok(bus) = env::var("MESHRADIO_BUS") {
            config.local_bus_name = bus;
        }
        if let Ok(hops) = env::var("MESHRADIO_MAX_HOPS") {
            if let Ok(hops) = hops.parse() {
                config.max_hops = hops;
            }
        }
        if let Ok(interval) = env::var("MESHRADIO_ANNOUNCE_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                config.announce_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(conns) = env::var("MESHRADIO_MAX_CONNECTIONS") {
            if let Ok(conns) = conns.parse() {
                config.max_connections = conns;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = NodeConfig::default();
        assert_eq!(config.announce_interval, Duration::from_secs(30));
        assert_eq!(config.stale_peer, Duration::from_secs(120));
        assert_eq!(config.route_stale, Duration::from_secs(300));
        assert_eq!(config.max_hops, 5);
        assert_eq!(config.dedup_capacity, 4096);
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.parked_capacity, 512);
    }

    #[test]
    fn max_hops_is_clamped() {
        let mut config = NodeConfig::default();
        config.max_hops = 42;
        let config = config.validate().unwrap();
        assert_eq!(config.max_hops, MAX_HOPS_LIMIT);

        let mut config = NodeConfig::default();
        config.max_hops = 0;
        let config = config.validate().unwrap();
        assert_eq!(config.max_hops, 1);
    }

    #[test]
    fn relay_without_endpoint_is_disabled() {
        let config = NodeConfig::default().validate().unwrap();
        assert!(!config
            .transports_enabled
            .contains(&TransportKind::RelayServer));
    }
}
