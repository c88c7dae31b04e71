//! The engine façade consumed by the UI and audio layers.
//!
//! A [`MeshNode`] owns every subsystem; its lifetime spans `power_on` /
//! `power_off`. All state the UI can observe flows out through the event
//! bus or the status snapshot; all input flows in through the small method
//! surface here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock as SyncRwLock};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::channel::{ChannelLayer, Transmission, TransmissionKind};
use crate::config::NodeConfig;
use crate::crypto::{derive_session_key, pairing, NodeKeypair, PairingBlob};
use crate::discovery::{Announce, PeerDirectory};
use crate::error::{Error, Result, SendError};
use crate::events::{EventBus, MeshEvent, SubscriptionToken};
use crate::mesh::{Pipeline, PipelineCommand, PipelineContext};
use crate::platform::Platform;
use crate::protocol::constants::{EMERGENCY_TTL, PRIORITY_NORMAL};
use crate::protocol::{short_id, NodeId, PacketId};
use crate::routing::RoutingTable;
use crate::session::{PairStore, PairingRecord};
use crate::status::{signal_quality, Counters, Status};
use crate::transport::{
    ConnectionPool, DirectLanTransport, LocalBusTransport, RelayTransport, ShortRangeDriver,
    ShortRangeTransport, Transport, TransportKind,
};

/// Options for `transmit_text` / `transmit_voice`
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub priority: u8,
    pub encrypt: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            priority: PRIORITY_NORMAL,
            encrypt: false,
        }
    }
}

/// Everything that only exists while powered on
struct EngineRuntime {
    pool: Arc<ConnectionPool>,
    pipeline_tx: mpsc::Sender<PipelineCommand>,
    transports: Vec<Arc<dyn Transport>>,
    transport_kinds: Vec<TransportKind>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct MeshNode {
    config: NodeConfig,
    platform: Platform,
    node_id: NodeId,
    keypair: Mutex<NodeKeypair>,
    pair_store: Arc<PairStore>,
    directory: Arc<PeerDirectory>,
    routing: Arc<RwLock<RoutingTable>>,
    channel: Arc<ChannelLayer>,
    counters: Arc<Counters>,
    events: Arc<EventBus>,
    short_range_driver: Mutex<Option<Arc<dyn ShortRangeDriver>>>,
    runtime: SyncRwLock<Option<EngineRuntime>>,
    last_status: Arc<Mutex<Option<Status>>>,
}

impl MeshNode {
    /// Construct the engine. The node id loads from (or persists into) the
    /// host blob store; the key pair is fresh per process.
    pub fn new(config: NodeConfig, platform: Platform) -> Result<Self> {
        let config = config.validate()?;
        let node_id = match config.node_id {
            Some(id) => id,
            None => platform.load_or_create_node_id()?,
        };
        let routing = RoutingTable::new(config.route_stale.as_millis() as u64);
        Ok(Self {
            node_id,
            keypair: Mutex::new(NodeKeypair::generate()),
            pair_store: Arc::new(PairStore::new()),
            directory: Arc::new(PeerDirectory::new()),
            routing: Arc::new(RwLock::new(routing)),
            channel: Arc::new(ChannelLayer::new(1)),
            counters: Arc::new(Counters::default()),
            events: EventBus::new(),
            short_range_driver: Mutex::new(None),
            runtime: SyncRwLock::new(None),
            last_status: Arc::new(Mutex::new(None)),
            config,
            platform,
        })
    }

    /// Install the host's short-range radio driver. Must happen before
    /// `power_on` for the ShortRange transport to come up.
    pub fn set_short_range_driver(&self, driver: Arc<dyn ShortRangeDriver>) {
        *self.short_range_driver.lock() = Some(driver);
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_powered(&self) -> bool {
        self.runtime.read().is_some()
    }

    // ---- lifecycle --------------------------------------------------------

    /// Bring the engine up. Idempotent; transports that fail to start are
    /// logged and omitted rather than failing the whole node.
    pub async fn power_on(&self) -> Result<()> {
        if self.is_powered() {
            return Ok(());
        }
        log::info!("powering on node {}", short_id(&self.node_id));

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        for kind in &self.config.transports_enabled {
            if !self.platform.monitor.transport_available(*kind) {
                log::info!("transport {} unavailable on this device", kind);
                continue;
            }
            let transport: Option<Arc<dyn Transport>> = match kind {
                TransportKind::DirectLan => Some(Arc::new(DirectLanTransport::new(
                    self.node_id,
                    self.config.lan_port,
                    event_tx.clone(),
                ))),
                TransportKind::RelayServer => self.config.relay_endpoint.as_ref().map(|endpoint| {
                    Arc::new(RelayTransport::new(
                        self.node_id,
                        endpoint.clone(),
                        event_tx.clone(),
                    )) as Arc<dyn Transport>
                }),
                TransportKind::ShortRange => self.short_range_driver.lock().clone().map(|driver| {
                    Arc::new(ShortRangeTransport::new(driver, event_tx.clone()))
                        as Arc<dyn Transport>
                }),
                TransportKind::LocalBus => Some(Arc::new(LocalBusTransport::new(
                    self.node_id,
                    self.config.local_bus_name.clone(),
                    event_tx.clone(),
                ))),
            };
            if let Some(transport) = transport {
                transports.push(transport);
            }
        }

        let mut started: Vec<Arc<dyn Transport>> = Vec::new();
        for transport in transports {
            match transport.start().await {
                Ok(()) => started.push(transport),
                Err(e) => log::warn!("transport {} failed to start: {}", transport.kind(), e),
            }
        }

        let transport_map: HashMap<TransportKind, Arc<dyn Transport>> = started
            .iter()
            .map(|t| (t.kind(), t.clone()))
            .collect();
        let transport_kinds: Vec<TransportKind> = transport_map.keys().copied().collect();
        let pool = Arc::new(ConnectionPool::new(
            transport_map,
            self.platform.clock.clone(),
            self.config.max_connections,
            self.config.dial_timeout,
        ));

        let (pipeline_tx, pipeline_rx) = mpsc::channel(256);
        let pipeline = Pipeline::new(
            PipelineContext {
                self_id: self.node_id,
                max_hops: self.config.max_hops,
                dedup_capacity: self.config.dedup_capacity,
                dedup_window_ms: self.config.dedup_window.as_millis() as u64,
                parked_capacity: self.config.parked_capacity,
                discovery_timeout_ms: self.config.discovery_timeout.as_millis() as u64,
                clock: self.platform.clock.clone(),
                routing: self.routing.clone(),
                directory: self.directory.clone(),
                pool: pool.clone(),
                pair_store: self.pair_store.clone(),
                channel: self.channel.clone(),
                events: self.events.clone(),
                counters: self.counters.clone(),
            },
            pipeline_rx,
            event_rx,
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(pipeline.run()));
        tasks.push(self.spawn_announcer(started.clone()));
        tasks.push(self.spawn_maintenance(pool.clone(), pipeline_tx.clone()));
        tasks.push(self.spawn_status(transport_kinds.clone()));

        *self.runtime.write() = Some(EngineRuntime {
            pool,
            pipeline_tx,
            transports: started,
            transport_kinds,
            tasks,
        });
        Ok(())
    }

    /// Take the engine down: stop accepting work, drain in-flight sends for
    /// up to two seconds, then close everything. Idempotent. Parked packets
    /// are memory-only and die here.
    pub async fn power_off(&self) -> Result<()> {
        let Some(runtime) = self.runtime.write().take() else {
            return Ok(());
        };
        log::info!("powering off node {}", short_id(&self.node_id));

        let (done_tx, done_rx) = oneshot::channel();
        if runtime
            .pipeline_tx
            .send(PipelineCommand::Shutdown(done_tx))
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(self.config.drain_timeout, done_rx).await;
        }

        for task in &runtime.tasks {
            task.abort();
        }
        for transport in &runtime.transports {
            transport.shutdown().await;
        }
        runtime.pool.close_all();

        let status = Status::offline(self.platform.monitor.battery_percent());
        *self.last_status.lock() = Some(status.clone());
        self.events.publish(&MeshEvent::StatusChanged(status));
        Ok(())
    }

    // ---- channel and transmission surface ---------------------------------

    pub fn set_channel(&self, channel: u8) -> Result<()> {
        self.channel.set_channel(channel)
    }

    pub fn current_channel(&self) -> u8 {
        self.channel.current_channel()
    }

    pub async fn transmit_text(
        &self,
        text: &str,
        options: SendOptions,
    ) -> std::result::Result<PacketId, SendError> {
        self.transmit(TransmissionKind::Text, text.as_bytes(), options)
            .await
    }

    pub async fn transmit_voice(
        &self,
        frame: &[u8],
        options: SendOptions,
    ) -> std::result::Result<PacketId, SendError> {
        self.transmit(TransmissionKind::Voice, frame, options).await
    }

    async fn transmit(
        &self,
        kind: TransmissionKind,
        content: &[u8],
        options: SendOptions,
    ) -> std::result::Result<PacketId, SendError> {
        let pipeline_tx = self.pipeline_sender().ok_or(SendError::PoweredOff)?;
        if content.len() > self.config.max_payload_bytes.saturating_sub(64) {
            return Err(SendError::PayloadTooLarge);
        }

        let packets = self
            .channel
            .build_packets(
                self.node_id,
                kind,
                content,
                options.priority,
                options.encrypt,
                self.config.max_hops,
                self.platform.clock.now_ms(),
                &self.pair_store,
            )
            .map_err(to_send_error)?;

        let first_id = packets[0].packet_id;
        for packet in packets {
            pipeline_tx
                .try_send(PipelineCommand::Transmit(packet))
                .map_err(|_| SendError::Backpressure)?;
        }
        Ok(first_id)
    }

    /// Broadcast an emergency beacon: priority 10, TTL 10, retried from the
    /// parked queue until somebody hears it.
    pub async fn send_emergency_beacon(
        &self,
        message: &str,
        location: Option<(f64, f64)>,
    ) -> std::result::Result<PacketId, SendError> {
        let pipeline_tx = self.pipeline_sender().ok_or(SendError::PoweredOff)?;
        if message.len() > self.config.max_payload_bytes.saturating_sub(64) {
            return Err(SendError::PayloadTooLarge);
        }
        let packet = self
            .channel
            .build_emergency_packet(
                self.node_id,
                message,
                location,
                self.platform.clock.now_ms(),
            )
            .map_err(to_send_error)?;
        debug_assert_eq!(packet.ttl, EMERGENCY_TTL);
        let id = packet.packet_id;
        pipeline_tx
            .try_send(PipelineCommand::Transmit(packet))
            .map_err(|_| SendError::Backpressure)?;
        Ok(id)
    }

    // ---- subscriptions ----------------------------------------------------

    /// Deliver transmissions for `channel` to `callback`. The token
    /// unsubscribes on drop.
    pub fn subscribe_channel<F>(&self, channel: u8, callback: F) -> SubscriptionToken
    where
        F: Fn(Transmission) + Send + Sync + 'static,
    {
        self.events.subscribe(move |event| {
            if let MeshEvent::TransmissionReceived(transmission) = event {
                if transmission.channel == channel {
                    callback(transmission.clone());
                }
            }
        })
    }

    /// Status snapshots: one immediately, then on every change.
    pub async fn subscribe_status<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(Status) + Send + Sync + 'static,
    {
        callback(self.status().await);
        self.events.subscribe(move |event| {
            if let MeshEvent::StatusChanged(status) = event {
                callback(status.clone());
            }
        })
    }

    /// Raw event stream (peers, pairing, emergencies, fatal errors).
    pub fn subscribe_events<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    // ---- pairing ----------------------------------------------------------

    /// Produce the base64 blob the user hands to the peer out-of-band.
    pub fn generate_pairing_code(&self) -> String {
        let public_key = self.keypair.lock().public_bytes();
        PairingBlob::new(self.node_id, public_key, self.platform.clock.now_ms()).encode()
    }

    /// Ingest a peer's pairing blob; the bond starts unverified.
    pub fn ingest_pairing_code(&self, code: &str) -> Result<NodeId> {
        let blob = PairingBlob::decode(code)?;
        let now = self.platform.clock.now_ms();
        if blob.is_expired(now) {
            return Err(Error::PairingExpired);
        }
        if blob.device_id == self.node_id {
            return Err(Error::DecodePairingBlob("own pairing blob".into()));
        }

        let shared = self.keypair.lock().diffie_hellman(&blob.public_key);
        let record = PairingRecord {
            peer_id: blob.device_id,
            their_public_key: blob.public_key,
            session_key: derive_session_key(&shared),
            verified: false,
            created_ms: now,
        };
        self.pair_store.insert_pending(record.clone());
        self.events
            .publish(&MeshEvent::PairingStateChanged(record));
        Ok(blob.device_id)
    }

    /// The 6-character code both users compare out-of-band. Identical on
    /// both devices of a bond.
    pub fn verification_code(&self, peer_id: &NodeId) -> Result<String> {
        let record = self.pair_store.get(peer_id).ok_or(Error::NotPaired)?;
        Ok(pairing::verification_code(
            &record.session_key,
            &self.node_id,
            peer_id,
        ))
    }

    /// Confirm the out-of-band code; a match flips the bond to verified.
    pub fn verify_pairing(&self, peer_id: &NodeId, code: &str) -> Result<bool> {
        let expected = self.verification_code(peer_id)?;
        if !pairing::codes_match(&expected, code) {
            return Ok(false);
        }
        if let Some(record) = self.pair_store.mark_verified(peer_id) {
            self.events
                .publish(&MeshEvent::PairingStateChanged(record));
        }
        Ok(true)
    }

    pub fn remove_pairing(&self, peer_id: &NodeId) {
        if let Some(mut record) = self.pair_store.get(peer_id) {
            self.pair_store.remove(peer_id);
            record.verified = false;
            self.events
                .publish(&MeshEvent::PairingStateChanged(record));
        }
    }

    /// Regenerate the key pair and drop every bond; peers must pair again.
    pub fn rotate_keys(&self) {
        *self.keypair.lock() = NodeKeypair::generate();
        self.pair_store.clear();
        log::info!("keys rotated, all pairings discarded");
    }

    /// Verified bonds, for the UI's paired-devices list.
    pub fn paired_peers(&self) -> Vec<PairingRecord> {
        self.pair_store.list_verified()
    }

    // ---- introspection ----------------------------------------------------

    pub fn peers(&self) -> Vec<crate::discovery::Peer> {
        self.directory.list()
    }

    pub async fn status(&self) -> Status {
        let powered = self.is_powered();
        let kinds = self
            .runtime
            .read()
            .as_ref()
            .map(|r| r.transport_kinds.clone())
            .unwrap_or_default();
        self.compute_status(powered, kinds).await
    }

    async fn compute_status(&self, powered: bool, transports: Vec<TransportKind>) -> Status {
        if !powered {
            return Status::offline(self.platform.monitor.battery_percent());
        }
        let now = self.platform.clock.now_ms();
        let (avg_latency_ms, reliability) = self.routing.read().await.aggregates();
        let active = self
            .directory
            .active_count(now, self.config.stale_peer.as_millis() as u64);
        Status {
            battery_percent: self.platform.monitor.battery_percent(),
            online: self.platform.monitor.is_online(),
            signal_quality: signal_quality(active, reliability),
            peer_count: self.directory.len(),
            active_peer_count: active,
            avg_latency_ms,
            reliability,
            transports_available: transports,
            counters: self.counters.snapshot(),
        }
    }

    fn pipeline_sender(&self) -> Option<mpsc::Sender<PipelineCommand>> {
        self.runtime
            .read()
            .as_ref()
            .map(|r| r.pipeline_tx.clone())
    }

    // ---- background tasks -------------------------------------------------

    fn spawn_announcer(&self, transports: Vec<Arc<dyn Transport>>) -> JoinHandle<()> {
        let node_id = self.node_id;
        let display_name = self.config.display_name.clone();
        let capabilities = self.config.capabilities.clone();
        let clock = self.platform.clock.clone();
        let monitor = self.platform.monitor.clone();
        let counters = self.counters.clone();
        let announce_interval = self.config.announce_interval;

        tokio::spawn(async move {
            let mut ticker = interval(announce_interval);
            loop {
                ticker.tick().await;
                let endpoints: Vec<(TransportKind, String)> = transports
                    .iter()
                    .filter_map(|t| t.local_endpoint().map(|e| (t.kind(), e)))
                    .collect();
                let announce = Announce {
                    node_id,
                    display_name: display_name.clone(),
                    capabilities: capabilities.clone(),
                    battery_percent: monitor.battery_percent(),
                    monotonic_ms: clock.now_ms(),
                    endpoints,
                };
                let frame = match announce
                    .into_packet(clock.now_ms())
                    .and_then(|p| Ok(crate::protocol::framing::encode(&p)?))
                {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("announce build failed: {}", e);
                        continue;
                    }
                };
                for transport in &transports {
                    if let Err(e) = transport.announce(frame.clone()).await {
                        log::debug!("announce over {} failed: {}", transport.kind(), e);
                    }
                }
                Counters::bump(&counters.announces_sent);
            }
        })
    }

    fn spawn_maintenance(
        &self,
        pool: Arc<ConnectionPool>,
        pipeline_tx: mpsc::Sender<PipelineCommand>,
    ) -> JoinHandle<()> {
        let node_id = self.node_id;
        let max_hops = self.config.max_hops;
        let clock = self.platform.clock.clone();
        let routing = self.routing.clone();
        let directory = self.directory.clone();
        let pair_store = self.pair_store.clone();
        let events = self.events.clone();
        let stale_peer_ms = self.config.stale_peer.as_millis() as u64;

        tokio::spawn(async move {
            // Congestion decays every 10 s; sweeps and probes run each
            // minute.
            let mut ticker = interval(Duration::from_secs(10));
            let mut ticks: u64 = 0;
            loop {
                ticker.tick().await;
                ticks += 1;
                let now = clock.now_ms();

                routing.write().await.decay_congestion();

                if ticks % 6 == 0 {
                    let lost = directory.sweep_stale(now, stale_peer_ms);
                    {
                        let mut routing = routing.write().await;
                        for peer in &lost {
                            routing.remove_destination(peer);
                        }
                        routing.sweep_stale(now);
                    }
                    for peer in lost {
                        log::info!("peer {} went stale", short_id(&peer));
                        events.publish(&MeshEvent::PeerLost(peer));
                    }

                    pair_store.gc_unverified(now);
                    pool.prune();

                    // Probe routes that have been silent for a minute.
                    let silent = routing.read().await.silent_routes(now);
                    for route in silent {
                        let probe = Pipeline::build_probe(
                            node_id,
                            route.destination,
                            max_hops,
                            now,
                        );
                        let _ = pipeline_tx.try_send(PipelineCommand::Transmit(probe));
                    }
                }
            }
        })
    }

    fn spawn_status(&self, transports: Vec<TransportKind>) -> JoinHandle<()> {
        let clock = self.platform.clock.clone();
        let monitor = self.platform.monitor.clone();
        let routing = self.routing.clone();
        let directory = self.directory.clone();
        let counters = self.counters.clone();
        let events = self.events.clone();
        let last_status = self.last_status.clone();
        let stale_peer_ms = self.config.stale_peer.as_millis() as u64;
        let status_interval = self.config.status_interval;

        tokio::spawn(async move {
            let mut ticker = interval(status_interval);
            loop {
                ticker.tick().await;
                let now = clock.now_ms();
                let (avg_latency_ms, reliability) = routing.read().await.aggregates();
                let active = directory.active_count(now, stale_peer_ms);
                let status = Status {
                    battery_percent: monitor.battery_percent(),
                    online: monitor.is_online(),
                    signal_quality: signal_quality(active, reliability),
                    peer_count: directory.len(),
                    active_peer_count: active,
                    avg_latency_ms,
                    reliability,
                    transports_available: transports.clone(),
                    counters: counters.snapshot(),
                };

                let changed = {
                    let mut last = last_status.lock();
                    if last.as_ref() != Some(&status) {
                        *last = Some(status.clone());
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    events.publish(&MeshEvent::StatusChanged(status));
                }
            }
        })
    }
}

fn to_send_error(error: Error) -> SendError {
    error.as_send_error().unwrap_or(SendError::Backpressure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn test_node(bus: &str) -> MeshNode {
        let mut config = NodeConfig::default();
        config.transports_enabled = vec![TransportKind::LocalBus];
        config.local_bus_name = bus.to_string();
        MeshNode::new(config, Platform::in_process()).unwrap()
    }

    #[tokio::test]
    async fn power_cycle_is_idempotent() {
        let node = test_node("node-power");
        assert!(!node.is_powered());
        node.power_on().await.unwrap();
        node.power_on().await.unwrap();
        assert!(node.is_powered());
        node.power_off().await.unwrap();
        node.power_off().await.unwrap();
        assert!(!node.is_powered());
    }

    #[tokio::test]
    async fn transmit_while_off_fails() {
        let node = test_node("node-off");
        let result = node.transmit_text("hi", SendOptions::default()).await;
        assert_eq!(result.unwrap_err(), SendError::PoweredOff);
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected() {
        let node = test_node("node-size");
        node.power_on().await.unwrap();
        let huge = vec![0u8; 70_000];
        let result = node.transmit_voice(&huge, SendOptions::default()).await;
        assert_eq!(result.unwrap_err(), SendError::PayloadTooLarge);
        node.power_off().await.unwrap();
    }

    #[tokio::test]
    async fn encrypted_transmit_without_bond_fails() {
        let node = test_node("node-nopair");
        node.power_on().await.unwrap();
        let result = node
            .transmit_text(
                "secret",
                SendOptions {
                    priority: 5,
                    encrypt: true,
                },
            )
            .await;
        assert_eq!(result.unwrap_err(), SendError::NotPaired);
        node.power_off().await.unwrap();
    }

    #[tokio::test]
    async fn pairing_flow_end_to_end() {
        let a = test_node("pair-a");
        let b = test_node("pair-b");

        let blob_a = a.generate_pairing_code();
        let blob_b = b.generate_pairing_code();
        let b_id = a.ingest_pairing_code(&blob_b).unwrap();
        let a_id = b.ingest_pairing_code(&blob_a).unwrap();
        assert_eq!(b_id, b.node_id());
        assert_eq!(a_id, a.node_id());

        // Both devices display the same code.
        let code_on_a = a.verification_code(&b_id).unwrap();
        let code_on_b = b.verification_code(&a_id).unwrap();
        assert_eq!(code_on_a, code_on_b);

        assert!(a.verify_pairing(&b_id, &code_on_b).unwrap());
        assert!(b.verify_pairing(&a_id, &code_on_a).unwrap());
        assert_eq!(a.paired_peers().len(), 1);
        assert_eq!(b.paired_peers().len(), 1);

        // A wrong code never verifies.
        assert!(!a.verify_pairing(&b_id, "zzzzzz").unwrap());
    }

    #[tokio::test]
    async fn rotate_keys_drops_bonds() {
        let a = test_node("rotate-a");
        let b = test_node("rotate-b");
        let blob_b = b.generate_pairing_code();
        let b_id = a.ingest_pairing_code(&blob_b).unwrap();
        let code = a.verification_code(&b_id).unwrap();
        a.verify_pairing(&b_id, &code).unwrap();
        assert_eq!(a.paired_peers().len(), 1);

        a.rotate_keys();
        assert!(a.paired_peers().is_empty());
    }

    #[tokio::test]
    async fn own_pairing_blob_is_rejected() {
        let a = test_node("self-pair");
        let blob = a.generate_pairing_code();
        assert!(a.ingest_pairing_code(&blob).is_err());
    }

    #[tokio::test]
    async fn channel_setting_is_validated() {
        let node = test_node("channels");
        node.set_channel(42).unwrap();
        assert_eq!(node.current_channel(), 42);
        assert!(node.set_channel(0).is_err());
        assert!(node.set_channel(100).is_err());
        assert_eq!(node.current_channel(), 42);
    }

    #[tokio::test]
    async fn status_reflects_power_state() {
        let node = test_node("status");
        let off = node.status().await;
        assert!(!off.online);

        node.power_on().await.unwrap();
        let on = node.status().await;
        assert!(on.online);
        assert_eq!(on.transports_available, vec![TransportKind::LocalBus]);
        node.power_off().await.unwrap();
    }
}
