//! The packet pipeline: ingress, dispatch, egress.
//!
//! One worker task owns every mutable piece here (dedup cache, egress
//! priority queue, parked queue, pending discoveries), per the engine's
//! single-writer rule. Transport events and transmit commands both land in
//! this loop; everything else reads through short-lived snapshots.
//!
//! Stages:
//! 1. ingress: decode, dedup, trace-append, TTL decrement
//! 2. dispatch: deliver upward and/or queue for forwarding (loop-free)
//! 3. egress: route-select, pool-acquire, encode, send; broadcasts fan out
//!    to every open handle except the inbound one

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::channel::ChannelLayer;
use crate::discovery::{Announce, PeerChange, PeerDirectory};
use crate::error::Error;
use crate::events::{EventBus, MeshEvent};
use crate::platform::Clock;
use crate::protocol::{framing, short_id, NodeId, Packet, PacketId, PacketType};
use crate::routing::on_demand::RoutePayload;
use crate::routing::{QosRequirements, Route, RoutingTable};
use crate::session::PairStore;
use crate::status::Counters;
use crate::transport::{ConnectionPool, TransportEvent, TransportKind};

use super::dedup::DedupCache;
use super::parked::ParkedQueue;
use super::queue::{EgressTarget, PriorityQueue, QueuedPacket};

/// Control priority for RREQ/RREP/ACK traffic: above normal transmissions,
/// below emergencies.
const CONTROL_PRIORITY: u8 = 8;

/// Egress queue bound
const EGRESS_CAPACITY: usize = 1024;

/// Reliability penalty applied when a link fails under a route
const LINK_FAILURE_PENALTY: f64 = 10.0;

/// Sent-packet records are kept this long for latency measurement
const SENT_LOG_TTL_MS: u64 = 30_000;

/// How many peers a broadcast will dial when no session is open yet
const MAX_BROADCAST_DIALS: usize = 8;

/// Loop cadence when the egress queue is empty / backlogged
const IDLE_TICK: Duration = Duration::from_millis(200);
const BUSY_TICK: Duration = Duration::from_millis(5);

/// Commands the engine feeds into the pipeline worker
pub enum PipelineCommand {
    /// A locally originated packet
    Transmit(Packet),
    /// Drain and stop; acknowledges on the supplied channel
    Shutdown(oneshot::Sender<()>),
}

/// Everything the worker needs from the rest of the engine
pub struct PipelineContext {
    pub self_id: NodeId,
    pub max_hops: u8,
    pub dedup_capacity: usize,
    pub dedup_window_ms: u64,
    pub parked_capacity: usize,
    pub discovery_timeout_ms: u64,
    pub clock: Arc<dyn Clock>,
    pub routing: Arc<RwLock<RoutingTable>>,
    pub directory: Arc<PeerDirectory>,
    pub pool: Arc<ConnectionPool>,
    pub pair_store: Arc<PairStore>,
    pub channel: Arc<ChannelLayer>,
    pub events: Arc<EventBus>,
    pub counters: Arc<Counters>,
}

struct PendingDiscovery {
    started_ms: u64,
    packets: Vec<Packet>,
}

struct SentRecord {
    destination: NodeId,
    next_hop: NodeId,
    sent_ms: u64,
}

pub struct Pipeline {
    ctx: PipelineContext,
    dedup: DedupCache,
    egress: PriorityQueue,
    parked: ParkedQueue,
    pending: HashMap<NodeId, PendingDiscovery>,
    sent_log: HashMap<PacketId, SentRecord>,
    commands: mpsc::Receiver<PipelineCommand>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Pipeline {
    pub fn new(
        ctx: PipelineContext,
        commands: mpsc::Receiver<PipelineCommand>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let dedup = DedupCache::new(ctx.dedup_capacity, ctx.dedup_window_ms);
        let parked = ParkedQueue::new(ctx.parked_capacity);
        Self {
            ctx,
            dedup,
            egress: PriorityQueue::new(EGRESS_CAPACITY),
            parked,
            pending: HashMap::new(),
            sent_log: HashMap::new(),
            commands,
            transport_events,
        }
    }

    /// Worker loop; runs until a `Shutdown` command arrives or both inputs
    /// close.
    pub async fn run(mut self) {
        let mut last_maintenance_ms = self.ctx.clock.now_ms();
        loop {
            let wait = if self.egress.is_empty() {
                IDLE_TICK
            } else {
                BUSY_TICK
            };
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(PipelineCommand::Transmit(packet)) => {
                        self.handle_transmit(packet).await;
                    }
                    Some(PipelineCommand::Shutdown(done)) => {
                        self.drain_egress().await;
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                },
                event = self.transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        // Only an abnormal collapse of the transport layer
                        // closes this stream while we are still running.
                        self.ctx.events.publish(&MeshEvent::FatalError(
                            "transport event stream closed".into(),
                        ));
                        break;
                    }
                },
                _ = tokio::time::sleep(wait) => {}
            }

            self.drain_egress().await;

            let now = self.ctx.clock.now_ms();
            if now.saturating_sub(last_maintenance_ms) >= 1_000 {
                last_maintenance_ms = now;
                self.expire_discoveries(now).await;
                self.retry_parked_emergencies(now).await;
                self.sent_log
                    .retain(|_, record| now.saturating_sub(record.sent_ms) <= SENT_LOG_TTL_MS);
            }
        }
    }

    // ---- transport events -------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { handle } => {
                let peer = handle.peer();
                self.ctx.pool.register(handle);
                self.ctx.directory.touch(&peer, self.ctx.clock.now_ms());
                self.wake_parked_for(&peer).await;
                self.wake_parked_broadcasts().await;
            }
            TransportEvent::Disconnected { peer, kind, reason } => {
                log::debug!(
                    "link to {} over {} closed: {}",
                    short_id(&peer),
                    kind,
                    reason
                );
                self.ctx.pool.on_link_error(&peer, kind);
                self.ctx
                    .routing
                    .write()
                    .await
                    .penalize_next_hop(&peer, LINK_FAILURE_PENALTY);
            }
            TransportEvent::FrameReceived {
                peer,
                kind,
                signal_strength,
                bytes,
            } => {
                self.ingress(Some(peer), kind, signal_strength, None, bytes)
                    .await;
            }
            TransportEvent::AnnounceReceived {
                kind,
                signal_strength,
                origin,
                bytes,
            } => {
                self.ingress(None, kind, signal_strength, origin, bytes).await;
            }
            TransportEvent::Error { peer, kind, message } => {
                log::warn!("transport {} error ({:?}): {}", kind, peer, message);
                if let Some(peer) = peer {
                    self.ctx.pool.on_link_error(&peer, kind);
                    self.ctx
                        .routing
                        .write()
                        .await
                        .penalize_next_hop(&peer, LINK_FAILURE_PENALTY);
                }
            }
        }
    }

    // ---- ingress ----------------------------------------------------------

    async fn ingress(
        &mut self,
        from: Option<NodeId>,
        kind: TransportKind,
        signal_strength: u8,
        origin: Option<String>,
        bytes: Vec<u8>,
    ) {
        let now = self.ctx.clock.now_ms();

        let mut packet = match framing::decode(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                Counters::bump(&self.ctx.counters.framing_errors);
                log::debug!("rejected frame from {:?}: {}", from.map(|p| short_id(&p)), e);
                return;
            }
        };
        Counters::bump(&self.ctx.counters.packets_received);

        // Our own broadcasts come back over shared media.
        if packet.source == self.ctx.self_id {
            return;
        }

        if packet.packet_type == PacketType::Heartbeat {
            self.handle_announce(&packet, kind, signal_strength, origin.as_deref(), now)
                .await;
            return;
        }

        if self.dedup.check_and_insert(packet.packet_id, now) {
            Counters::bump(&self.ctx.counters.duplicates_dropped);
            return;
        }

        self.ctx.directory.touch(&packet.source, now);
        if let Some(from) = from {
            self.ctx.directory.touch(&from, now);
        }

        // This node joins the trace and the hop budget shrinks.
        let inbound = from;
        packet.record_hop(self.ctx.self_id);

        // Passive reverse-path learning: the packet proves a path back to
        // its source through the inbound peer.
        if let Some(inbound_peer) = inbound {
            let hops_back = (packet.route_trace.len().saturating_sub(1)).min(255) as u8;
            let route = Route {
                destination: packet.source,
                next_hop: inbound_peer,
                hop_count: hops_back.max(1),
                ewma_latency_ms: 50.0,
                reliability: signal_strength as f64,
                last_updated_ms: now,
                transport: kind,
                bandwidth_kbps: kind.bandwidth_kbps(),
            };
            self.ctx.routing.write().await.install(route, now, true);
        }

        match packet.packet_type {
            PacketType::Heartbeat => {}
            PacketType::RouteRequest => {
                self.handle_rreq(packet, inbound, kind, signal_strength, now)
                    .await;
            }
            PacketType::RouteReply => {
                self.handle_rrep(packet, inbound, kind, signal_strength, now)
                    .await;
            }
            PacketType::Ack => {
                self.handle_ack(packet, inbound, now).await;
            }
            PacketType::Voice | PacketType::Text | PacketType::Emergency => {
                self.handle_transmission(packet, inbound, signal_strength, now)
                    .await;
            }
        }
    }

    async fn handle_announce(
        &mut self,
        packet: &Packet,
        kind: TransportKind,
        signal_strength: u8,
        origin: Option<&str>,
        now: u64,
    ) {
        let announce = match Announce::decode(&packet.payload) {
            Ok(announce) => announce,
            Err(e) => {
                log::debug!("undecodable announce: {}", e);
                return;
            }
        };
        if announce.node_id != packet.source {
            return;
        }

        let change = self.ctx.directory.upsert_from_announce(
            announce,
            kind,
            signal_strength,
            origin,
            now,
        );

        // A fresh announcement is a 1-hop route.
        let route = Route {
            destination: packet.source,
            next_hop: packet.source,
            hop_count: 1,
            ewma_latency_ms: 20.0,
            reliability: signal_strength as f64,
            last_updated_ms: now,
            transport: kind,
            bandwidth_kbps: kind.bandwidth_kbps(),
        };
        self.ctx.routing.write().await.install(route, now, false);

        match change {
            PeerChange::Discovered(peer) => {
                log::info!("discovered peer {} over {}", short_id(&peer.node_id), kind);
                self.ctx.events.publish(&MeshEvent::PeerDiscovered(peer));
            }
            PeerChange::Updated(peer) => {
                self.ctx.events.publish(&MeshEvent::PeerUpdated(peer));
            }
        }

        self.wake_parked_for(&packet.source).await;
        self.wake_parked_broadcasts().await;
        self.flush_pending(&packet.source, now).await;
    }

    // ---- dispatch ---------------------------------------------------------

    async fn handle_transmission(
        &mut self,
        packet: Packet,
        inbound: Option<NodeId>,
        signal_strength: u8,
        now: u64,
    ) {
        let for_us = packet.destination == self.ctx.self_id;
        let broadcast = packet.is_broadcast();

        if for_us || broadcast {
            self.deliver_local(&packet, signal_strength, now).await;
        }

        if broadcast {
            // Broadcasts keep flooding after local delivery.
            self.queue_forward_broadcast(packet, inbound, now);
        } else if !for_us {
            self.queue_forward_unicast(packet, now).await;
        }
    }

    async fn deliver_local(&mut self, packet: &Packet, signal_strength: u8, now: u64) {
        match packet.packet_type {
            PacketType::Emergency => match self.ctx.channel.deliver_emergency(packet, signal_strength) {
                Ok(transmission) => {
                    Counters::bump(&self.ctx.counters.packets_delivered);
                    self.ctx
                        .events
                        .publish(&MeshEvent::EmergencyReceived(transmission));
                }
                Err(e) => {
                    Counters::bump(&self.ctx.counters.packets_dropped);
                    log::debug!("undeliverable emergency beacon: {}", e);
                }
            },
            PacketType::Voice | PacketType::Text => {
                match self
                    .ctx
                    .channel
                    .deliver(packet, signal_strength, &self.ctx.pair_store)
                {
                    Ok(Some(transmission)) => {
                        Counters::bump(&self.ctx.counters.packets_delivered);
                        self.ctx
                            .events
                            .publish(&MeshEvent::TransmissionReceived(transmission));
                    }
                    Ok(None) => {
                        // Another channel; not ours to surface.
                        Counters::bump(&self.ctx.counters.packets_dropped);
                    }
                    Err(Error::AuthFailed) | Err(Error::NotPaired) => {
                        Counters::bump(&self.ctx.counters.auth_failures);
                    }
                    Err(e) => {
                        Counters::bump(&self.ctx.counters.packets_dropped);
                        log::debug!("delivery failed: {}", e);
                    }
                }
            }
            _ => {}
        }

        // Unicast transmissions are acknowledged back to the source so its
        // route keeps a live latency estimate.
        if packet.destination == self.ctx.self_id && packet.packet_type.is_transmission() {
            let ack = Packet::originate(
                self.ctx.self_id,
                packet.source,
                PacketType::Ack,
                CONTROL_PRIORITY,
                self.ctx.max_hops,
                now,
                packet.packet_id.to_vec(),
            );
            self.dedup.check_and_insert(ack.packet_id, now);
            self.queue_forward_unicast(ack, now).await;
        }
    }

    fn queue_forward_broadcast(&mut self, packet: Packet, inbound: Option<NodeId>, now: u64) {
        if packet.ttl == 0 {
            Counters::bump(&self.ctx.counters.packets_dropped);
            return;
        }
        if inbound.is_some() && packet.trace_contains_before_last(&self.ctx.self_id) {
            // Already crossed this node; flooding further would loop.
            Counters::bump(&self.ctx.counters.packets_dropped);
            return;
        }
        let target = EgressTarget::Broadcast { exclude: inbound };
        if self.egress.push(packet, target, now).is_err() {
            Counters::bump(&self.ctx.counters.packets_dropped);
        }
    }

    async fn queue_forward_unicast(&mut self, packet: Packet, now: u64) {
        if packet.ttl == 0 {
            Counters::bump(&self.ctx.counters.packets_dropped);
            return;
        }
        if packet.trace_contains_before_last(&self.ctx.self_id) {
            Counters::bump(&self.ctx.counters.packets_dropped);
            return;
        }

        let qos = Self::qos_for(&packet);
        let selected = {
            let routing = self.ctx.routing.read().await;
            routing.select(&packet.destination, &qos, now)
        };

        match selected {
            Some(route) => {
                let target = EgressTarget::NextHop {
                    peer: route.next_hop,
                    transport: route.transport,
                };
                if self.egress.push(packet, target, now).is_err() {
                    Counters::bump(&self.ctx.counters.packets_dropped);
                }
            }
            None => {
                self.start_discovery(packet, now).await;
            }
        }
    }

    fn qos_for(packet: &Packet) -> QosRequirements {
        match packet.packet_type {
            PacketType::Voice => QosRequirements {
                priority: packet.priority,
                max_latency_ms: Some(400.0),
                min_bandwidth_kbps: Some(64),
            },
            PacketType::Emergency => QosRequirements::emergency(),
            _ => QosRequirements {
                priority: packet.priority,
                max_latency_ms: None,
                min_bandwidth_kbps: None,
            },
        }
    }

    // ---- on-demand discovery ----------------------------------------------

    async fn start_discovery(&mut self, packet: Packet, now: u64) {
        let destination = packet.destination;
        if let Some(pending) = self.pending.get_mut(&destination) {
            pending.packets.push(packet);
            return;
        }

        log::debug!("route discovery for {}", short_id(&destination));
        let rreq = Packet::originate(
            self.ctx.self_id,
            crate::protocol::BROADCAST,
            PacketType::RouteRequest,
            CONTROL_PRIORITY,
            self.ctx.max_hops,
            now,
            RoutePayload::new(destination, 0).encode(),
        );
        self.dedup.check_and_insert(rreq.packet_id, now);
        self.sent_log.insert(
            rreq.packet_id,
            SentRecord {
                destination,
                next_hop: crate::protocol::BROADCAST,
                sent_ms: now,
            },
        );
        let _ = self
            .egress
            .push(rreq, EgressTarget::Broadcast { exclude: None }, now);

        self.pending.insert(
            destination,
            PendingDiscovery {
                started_ms: now,
                packets: vec![packet],
            },
        );
    }

    async fn handle_rreq(
        &mut self,
        packet: Packet,
        inbound: Option<NodeId>,
        _kind: TransportKind,
        _signal_strength: u8,
        now: u64,
    ) {
        let Some(payload) = RoutePayload::decode(&packet.payload) else {
            Counters::bump(&self.ctx.counters.packets_dropped);
            return;
        };

        // Reverse route to the requester was installed at ingress; a
        // matching RREP can retrace it.
        if payload.target == self.ctx.self_id {
            let rrep = Packet::originate(
                self.ctx.self_id,
                packet.source,
                PacketType::RouteReply,
                CONTROL_PRIORITY,
                self.ctx.max_hops,
                now,
                RoutePayload::new(self.ctx.self_id, 0).encode(),
            );
            self.dedup.check_and_insert(rrep.packet_id, now);
            self.queue_forward_unicast(rrep, now).await;
            return;
        }

        // Not the target: keep flooding while the budget lasts.
        if packet.ttl == 0 || packet.trace_contains_before_last(&self.ctx.self_id) {
            Counters::bump(&self.ctx.counters.packets_dropped);
            return;
        }
        let mut forwarded = packet;
        forwarded.payload = RoutePayload::new(payload.target, payload.hop_count + 1).encode();
        let target = EgressTarget::Broadcast { exclude: inbound };
        if self.egress.push(forwarded, target, now).is_err() {
            Counters::bump(&self.ctx.counters.packets_dropped);
        }
    }

    async fn handle_rrep(
        &mut self,
        packet: Packet,
        inbound: Option<NodeId>,
        kind: TransportKind,
        signal_strength: u8,
        now: u64,
    ) {
        let Some(payload) = RoutePayload::decode(&packet.payload) else {
            Counters::bump(&self.ctx.counters.packets_dropped);
            return;
        };
        let Some(inbound_peer) = inbound else {
            return;
        };

        // Forward route to the replying target; duplicate RREPs only
        // overwrite a strictly better path.
        let route = Route {
            destination: payload.target,
            next_hop: inbound_peer,
            hop_count: payload.hop_count + 1,
            ewma_latency_ms: 40.0,
            reliability: signal_strength as f64,
            last_updated_ms: now,
            transport: kind,
            bandwidth_kbps: kind.bandwidth_kbps(),
        };
        self.ctx.routing.write().await.install(route, now, true);

        if packet.destination == self.ctx.self_id {
            self.flush_pending(&payload.target, now).await;
            self.wake_parked_for(&payload.target).await;
        } else {
            let mut forwarded = packet;
            forwarded.payload =
                RoutePayload::new(payload.target, payload.hop_count + 1).encode();
            self.queue_forward_unicast(forwarded, now).await;
        }
    }

    async fn flush_pending(&mut self, destination: &NodeId, now: u64) {
        let Some(pending) = self.pending.remove(destination) else {
            return;
        };
        let latency = now.saturating_sub(pending.started_ms) as f64;
        {
            let mut routing = self.ctx.routing.write().await;
            if let Some(route) = routing.best(destination, now) {
                routing.record_latency(destination, &route.next_hop, latency, now);
            }
        }
        for packet in pending.packets {
            self.queue_forward_unicast(packet, now).await;
        }
    }

    async fn expire_discoveries(&mut self, now: u64) {
        let timeout = self.ctx.discovery_timeout_ms;
        let expired: Vec<NodeId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.started_ms) > timeout)
            .map(|(dest, _)| *dest)
            .collect();
        for destination in expired {
            let Some(pending) = self.pending.remove(&destination) else {
                continue;
            };
            log::debug!(
                "route discovery for {} timed out, {} packets affected",
                short_id(&destination),
                pending.packets.len()
            );
            for packet in pending.packets {
                if packet.is_emergency() {
                    // Emergencies never give up; they park and retry.
                    if self.parked.park(packet, now).is_err() {
                        Counters::bump(&self.ctx.counters.packets_dropped);
                    }
                } else {
                    Counters::bump(&self.ctx.counters.no_route_failures);
                    Counters::bump(&self.ctx.counters.packets_dropped);
                }
            }
        }
    }

    // ---- acks and probes --------------------------------------------------

    async fn handle_ack(&mut self, packet: Packet, inbound: Option<NodeId>, now: u64) {
        if packet.destination != self.ctx.self_id {
            self.queue_forward_unicast(packet, now).await;
            return;
        }

        if packet.payload.is_empty() {
            // A probe: echo it back so the prober can measure.
            let echo = Packet::originate(
                self.ctx.self_id,
                packet.source,
                PacketType::Ack,
                CONTROL_PRIORITY,
                self.ctx.max_hops,
                now,
                packet.packet_id.to_vec(),
            );
            self.dedup.check_and_insert(echo.packet_id, now);
            self.queue_forward_unicast(echo, now).await;
            return;
        }

        if packet.payload.len() == 16 {
            let mut acked: PacketId = [0u8; 16];
            acked.copy_from_slice(&packet.payload);
            if let Some(record) = self.sent_log.remove(&acked) {
                let latency = now.saturating_sub(record.sent_ms) as f64;
                let next_hop = inbound.unwrap_or(record.next_hop);
                self.ctx.routing.write().await.record_latency(
                    &record.destination,
                    &next_hop,
                    latency,
                    now,
                );
            }
        }
    }

    /// Send a probe toward a silent route. Called by engine maintenance.
    pub(crate) fn build_probe(self_id: NodeId, destination: NodeId, max_hops: u8, now: u64) -> Packet {
        Packet::originate(
            self_id,
            destination,
            PacketType::Ack,
            CONTROL_PRIORITY,
            max_hops,
            now,
            Vec::new(),
        )
    }

    // ---- locally originated traffic ---------------------------------------

    async fn handle_transmit(&mut self, packet: Packet) {
        let now = self.ctx.clock.now_ms();
        if let Err(e) = packet.check_emit_invariants(&self.ctx.self_id, self.ctx.max_hops) {
            log::error!("refusing to emit malformed packet: {}", e);
            Counters::bump(&self.ctx.counters.packets_dropped);
            return;
        }

        // Our own id enters the dedup cache so echoes die at ingress.
        self.dedup.check_and_insert(packet.packet_id, now);

        if packet.is_broadcast() {
            // With nobody in range the egress stage reports no path and the
            // packet parks for store-and-forward.
            let _ = self
                .egress
                .push(packet, EgressTarget::Broadcast { exclude: None }, now);
        } else {
            let is_probe =
                packet.packet_type == PacketType::Ack && packet.payload.is_empty();
            if packet.packet_type.is_transmission() || is_probe {
                self.sent_log.insert(
                    packet.packet_id,
                    SentRecord {
                        destination: packet.destination,
                        next_hop: packet.destination,
                        sent_ms: now,
                    },
                );
            }
            self.queue_forward_unicast(packet, now).await;
        }
    }

    // ---- egress -----------------------------------------------------------

    async fn drain_egress(&mut self) {
        let now = self.ctx.clock.now_ms();
        let mut deferred: Vec<QueuedPacket> = Vec::new();

        while let Some(entry) = self.egress.pop() {
            match entry.target {
                EgressTarget::Broadcast { exclude } => {
                    match self.send_broadcast(&entry.packet, exclude, now).await {
                        SendOutcome::Sent => {}
                        SendOutcome::Busy => {
                            deferred.push(entry);
                            break;
                        }
                        SendOutcome::NoPath => {
                            // Our own transmissions wait for a route;
                            // forwarded floods simply end at a leaf.
                            if entry.packet.source == self.ctx.self_id {
                                if self.parked.park(entry.packet, now).is_err() {
                                    Counters::bump(&self.ctx.counters.packets_dropped);
                                }
                            } else {
                                Counters::bump(&self.ctx.counters.packets_dropped);
                            }
                        }
                    }
                }
                EgressTarget::NextHop { peer, transport } => {
                    match self.send_unicast(&entry.packet, peer, transport, now).await {
                        SendOutcome::Sent => {}
                        SendOutcome::Busy => {
                            deferred.push(entry);
                            break;
                        }
                        SendOutcome::NoPath => {
                            self.reroute_or_park(entry.packet, peer, now).await;
                        }
                    }
                }
            }
        }

        for entry in deferred {
            self.egress.requeue(entry);
        }
    }

    async fn send_broadcast(
        &mut self,
        packet: &Packet,
        exclude: Option<NodeId>,
        now: u64,
    ) -> SendOutcome {
        let bytes = match framing::encode(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("encode failed: {}", e);
                Counters::bump(&self.ctx.counters.packets_dropped);
                return SendOutcome::Sent;
            }
        };

        let handles = self.ctx.pool.open_handles();
        let mut targets: Vec<_> = handles
            .into_iter()
            .filter(|h| Some(h.peer()) != exclude)
            .collect();

        // No sessions yet: a shared medium still has neighbors we have
        // heard announcements from. Dial the closest few so the flood has
        // somewhere to go.
        if targets.is_empty() {
            for peer in self.ctx.directory.list() {
                if targets.len() >= MAX_BROADCAST_DIALS {
                    break;
                }
                if !peer.is_reachable || Some(peer.node_id) == exclude {
                    continue;
                }
                let plan = self.ctx.directory.dial_plan(&peer.node_id, None);
                if let Ok(handle) = self.ctx.pool.acquire(peer.node_id, &plan).await {
                    targets.push(handle);
                }
            }
        }
        if targets.is_empty() {
            return SendOutcome::NoPath;
        }

        let mut sent_any = false;
        let mut all_busy = true;
        for handle in targets {
            match handle.try_send(bytes.clone()) {
                Ok(()) => {
                    handle.touch(now);
                    sent_any = true;
                    all_busy = false;
                }
                Err(Error::Backpressure) => {}
                Err(_) => {
                    all_busy = false;
                }
            }
        }

        if sent_any {
            let forwarded = packet.source != self.ctx.self_id;
            if forwarded {
                Counters::bump(&self.ctx.counters.packets_forwarded);
            } else {
                Counters::bump(&self.ctx.counters.packets_sent);
            }
            SendOutcome::Sent
        } else if all_busy {
            SendOutcome::Busy
        } else {
            SendOutcome::NoPath
        }
    }

    async fn send_unicast(
        &mut self,
        packet: &Packet,
        peer: NodeId,
        transport: TransportKind,
        now: u64,
    ) -> SendOutcome {
        let bytes = match framing::encode(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("encode failed: {}", e);
                Counters::bump(&self.ctx.counters.packets_dropped);
                return SendOutcome::Sent;
            }
        };

        let plan = self.ctx.directory.dial_plan(&peer, Some(transport));
        let handle = match self.ctx.pool.acquire(peer, &plan).await {
            Ok(handle) => handle,
            Err(e) => {
                log::debug!("no link to next hop {}: {}", short_id(&peer), e);
                return SendOutcome::NoPath;
            }
        };

        match handle.try_send(bytes) {
            Ok(()) => {
                handle.touch(now);
                if packet.source == self.ctx.self_id {
                    Counters::bump(&self.ctx.counters.packets_sent);
                } else {
                    Counters::bump(&self.ctx.counters.packets_forwarded);
                }
                SendOutcome::Sent
            }
            Err(Error::Backpressure) => SendOutcome::Busy,
            Err(_) => SendOutcome::NoPath,
        }
    }

    async fn reroute_or_park(&mut self, packet: Packet, failed_hop: NodeId, now: u64) {
        {
            let mut routing = self.ctx.routing.write().await;
            routing.penalize_next_hop(&failed_hop, LINK_FAILURE_PENALTY);
        }

        let qos = Self::qos_for(&packet);
        let alternative = {
            let routing = self.ctx.routing.read().await;
            routing
                .select(&packet.destination, &qos, now)
                .filter(|r| r.next_hop != failed_hop)
        };

        match alternative {
            Some(route) => {
                let target = EgressTarget::NextHop {
                    peer: route.next_hop,
                    transport: route.transport,
                };
                if self.egress.push(packet, target, now).is_err() {
                    Counters::bump(&self.ctx.counters.packets_dropped);
                }
            }
            None => {
                self.start_discovery(packet, now).await;
            }
        }
    }

    // ---- store-and-forward wakeups ----------------------------------------

    async fn wake_parked_for(&mut self, destination: &NodeId) {
        let now = self.ctx.clock.now_ms();
        let ready = self.parked.take_for(destination, now);
        for entry in ready {
            self.queue_forward_unicast(entry.packet, now).await;
        }
    }

    async fn wake_parked_broadcasts(&mut self) {
        let now = self.ctx.clock.now_ms();
        if self.ctx.pool.open_handles().is_empty() && self.ctx.directory.is_empty() {
            return;
        }
        let ready = self
            .parked
            .take_matching(now, |entry| entry.packet.is_broadcast());
        for entry in ready {
            let _ = self.egress.push(
                entry.packet,
                EgressTarget::Broadcast { exclude: None },
                now,
            );
        }
    }

    async fn retry_parked_emergencies(&mut self, now: u64) {
        let due = self.parked.take_emergencies_due(now);
        for entry in due {
            if entry.packet.is_broadcast() {
                if self.ctx.pool.open_handles().is_empty() && self.ctx.directory.is_empty() {
                    self.parked.repark(entry, now);
                } else {
                    let packet = entry.packet.clone();
                    let _ = self.egress.push(
                        packet,
                        EgressTarget::Broadcast { exclude: None },
                        now,
                    );
                }
            } else {
                self.queue_forward_unicast(entry.packet, now).await;
            }
        }
        self.parked.sweep_expired(now);
    }
}

enum SendOutcome {
    Sent,
    Busy,
    NoPath,
}
