//! Channel layer: subscription, packetization, and delivery fan-out.
//!
//! A channel is an integer in 1..99. Outgoing voice/text wraps into a small
//! payload codec (`channel:1 | kind:1 | len:2 | content`, little-endian)
//! that is exactly what gets sealed when encryption is on, so the channel
//! number itself is confidential for bonded traffic. Emergency beacons are
//! channel-agnostic and never encrypted.

use std::sync::atomic::{AtomicU8, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::crypto::{open_payload, seal_payload, NONCE_LEN};
use crate::error::{Error, Result};
use crate::protocol::constants::{EMERGENCY_TTL, FLAG_EMERGENCY, FLAG_ENCRYPTED, PRIORITY_EMERGENCY};
use crate::protocol::{NodeId, Packet, PacketId, PacketType, BROADCAST};
use crate::session::PairStore;

/// What a transmission carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionKind {
    Voice,
    Text,
}

impl TransmissionKind {
    fn to_wire(self) -> u8 {
        match self {
            TransmissionKind::Voice => 0,
            TransmissionKind::Text => 1,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(TransmissionKind::Voice),
            1 => Some(TransmissionKind::Text),
            _ => None,
        }
    }

    pub fn packet_type(self) -> PacketType {
        match self {
            TransmissionKind::Voice => PacketType::Voice,
            TransmissionKind::Text => PacketType::Text,
        }
    }
}

/// A delivered channel transmission
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    /// Same as the carrying packet's id
    pub transmission_id: PacketId,
    pub sender_id: NodeId,
    pub channel: u8,
    pub content: Vec<u8>,
    pub kind: TransmissionKind,
    pub encrypted: bool,
    /// Sender's monotonic clock at transmit time
    pub timestamp_ms: u64,
    /// Signal strength observed at this receiver
    pub signal_strength: u8,
}

/// Emergency beacon payload (bincode, channel-agnostic)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyBeacon {
    pub channel: u8,
    pub message: String,
    /// Optional (latitude, longitude)
    pub location: Option<(f64, f64)>,
}

fn encode_transmission_payload(channel: u8, kind: TransmissionKind, content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + content.len());
    buf.push(channel);
    buf.push(kind.to_wire());
    let mut len = [0u8; 2];
    LittleEndian::write_u16(&mut len, content.len() as u16);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(content);
    buf
}

fn decode_transmission_payload(bytes: &[u8]) -> Option<(u8, TransmissionKind, Vec<u8>)> {
    if bytes.len() < 4 {
        return None;
    }
    let channel = bytes[0];
    let kind = TransmissionKind::from_wire(bytes[1])?;
    let len = LittleEndian::read_u16(&bytes[2..4]) as usize;
    if bytes.len() != 4 + len {
        return None;
    }
    Some((channel, kind, bytes[4..].to_vec()))
}

/// Channel subscription state plus sender-side packetization
pub struct ChannelLayer {
    current: AtomicU8,
}

impl ChannelLayer {
    pub fn new(channel: u8) -> Self {
        Self {
            current: AtomicU8::new(channel.clamp(1, 99)),
        }
    }

    pub fn set_channel(&self, channel: u8) -> Result<()> {
        if !(1..=99).contains(&channel) {
            return Err(Error::Config(format!("channel {} out of range", channel)));
        }
        self.current.store(channel, Ordering::SeqCst);
        Ok(())
    }

    pub fn current_channel(&self) -> u8 {
        self.current.load(Ordering::SeqCst)
    }

    /// Packetize an outgoing transmission on the current channel.
    ///
    /// Plaintext sends produce exactly one broadcast packet. Encrypted
    /// sends seal one copy per verified bond (AEAD is pairwise); with no
    /// verified bond the send fails `NotPaired`.
    pub fn build_packets(
        &self,
        self_id: NodeId,
        kind: TransmissionKind,
        content: &[u8],
        priority: u8,
        encrypt: bool,
        ttl: u8,
        now_ms: u64,
        pair_store: &PairStore,
    ) -> Result<Vec<Packet>> {
        let channel = self.current_channel();
        let plaintext = encode_transmission_payload(channel, kind, content);

        if !encrypt {
            let packet = Packet::originate(
                self_id,
                BROADCAST,
                kind.packet_type(),
                priority,
                ttl,
                now_ms,
                plaintext,
            );
            return Ok(vec![packet]);
        }

        let bonded = pair_store.verified_peers();
        if bonded.is_empty() {
            return Err(Error::NotPaired);
        }

        let mut packets = Vec::with_capacity(bonded.len());
        for peer in bonded {
            let session_key = pair_store.verified_session_key(&peer)?;
            let (ciphertext, nonce) = seal_payload(&session_key, &plaintext)?;
            let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            payload.extend_from_slice(&nonce);
            payload.extend_from_slice(&ciphertext);

            let mut packet = Packet::originate(
                self_id,
                BROADCAST,
                kind.packet_type(),
                priority,
                ttl,
                now_ms,
                payload,
            );
            packet.set_flag(FLAG_ENCRYPTED);
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Build the channel-agnostic emergency beacon packet.
    pub fn build_emergency_packet(
        &self,
        self_id: NodeId,
        message: &str,
        location: Option<(f64, f64)>,
        now_ms: u64,
    ) -> Result<Packet> {
        let beacon = EmergencyBeacon {
            channel: self.current_channel(),
            message: message.to_string(),
            location,
        };
        let payload = bincode::serialize(&beacon)?;
        let mut packet = Packet::originate(
            self_id,
            BROADCAST,
            PacketType::Emergency,
            PRIORITY_EMERGENCY,
            EMERGENCY_TTL,
            now_ms,
            payload,
        );
        packet.set_flag(FLAG_EMERGENCY);
        Ok(packet)
    }

    /// Deliver a voice/text packet addressed to (or overheard by) this
    /// node. `Ok(None)` means the transmission is for another channel and
    /// is dropped silently; crypto failures surface as errors for the
    /// caller's counters.
    pub fn deliver(
        &self,
        packet: &Packet,
        signal_strength: u8,
        pair_store: &PairStore,
    ) -> Result<Option<Transmission>> {
        let encrypted = packet.has_flag(FLAG_ENCRYPTED);
        let plaintext = if encrypted {
            if packet.payload.len() < NONCE_LEN {
                return Err(Error::AuthFailed);
            }
            let session_key = pair_store
                .verified_session_key(&packet.source)
                .map_err(|_| Error::AuthFailed)?;
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&packet.payload[..NONCE_LEN]);
            open_payload(&session_key, &packet.payload[NONCE_LEN..], &nonce)?
        } else {
            packet.payload.clone()
        };

        let (channel, kind, content) =
            decode_transmission_payload(&plaintext).ok_or(Error::AuthFailed)?;
        if channel != self.current_channel() {
            return Ok(None);
        }

        Ok(Some(Transmission {
            transmission_id: packet.packet_id,
            sender_id: packet.source,
            channel,
            content,
            kind,
            encrypted,
            timestamp_ms: packet.timestamp_ms,
            signal_strength,
        }))
    }

    /// Deliver an emergency beacon regardless of channel.
    pub fn deliver_emergency(
        &self,
        packet: &Packet,
        signal_strength: u8,
    ) -> Result<Transmission> {
        let beacon: EmergencyBeacon = bincode::deserialize(&packet.payload)?;
        Ok(Transmission {
            transmission_id: packet.packet_id,
            sender_id: packet.source,
            channel: beacon.channel,
            content: beacon.message.into_bytes(),
            kind: TransmissionKind::Text,
            encrypted: false,
            timestamp_ms: packet.timestamp_ms,
            signal_strength,
        })
    }
}
