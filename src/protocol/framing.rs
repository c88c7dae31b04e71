//! Binary wire codec.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic:4 | version:1 | type:1 | priority:1 | ttl:1
//! packet_id:16 | source_id:16 | destination_id:16
//! timestamp_ms:8 | flags:1
//! trace_len:1 | trace: trace_len * 16
//! payload_len:2 | payload: payload_len
//! crc32:4   (IEEE, over all prior bytes)
//! ```
//!
//! The decoder validates lengths before allocating and returns a tagged
//! error for every rejection; it never panics.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

use super::constants::*;
use super::{NodeId, Packet, PacketType};

/// Tagged decode/encode failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("bad magic")]
    BadMagic,
    #[error("unknown wire version {0}")]
    UnknownVersion(u8),
    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),
    #[error("route trace of {0} entries exceeds the hop limit")]
    TraceTooLong(u8),
    #[error("payload of {0} bytes exceeds the wire limit")]
    PayloadTooLarge(usize),
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    BadCrc { expected: u32, actual: u32 },
    #[error("frame truncated")]
    Truncated,
}

/// Encode a packet to its wire form.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, FrameError> {
    if packet.route_trace.len() > MAX_HOPS_LIMIT as usize {
        return Err(FrameError::TraceTooLong(packet.route_trace.len() as u8));
    }
    if packet.payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(packet.payload.len()));
    }

    let mut buf =
        Vec::with_capacity(FRAME_OVERHEAD + packet.route_trace.len() * 16 + packet.payload.len());
    buf.extend_from_slice(&PROTOCOL_MAGIC);
    buf.push(PROTOCOL_VERSION);
    buf.push(packet.packet_type as u8);
    buf.push(packet.priority);
    buf.push(packet.ttl);
    buf.extend_from_slice(&packet.packet_id);
    buf.extend_from_slice(&packet.source);
    buf.extend_from_slice(&packet.destination);
    buf.write_u64::<LittleEndian>(packet.timestamp_ms)
        .expect("vec write");
    buf.push(packet.flags);
    buf.push(packet.route_trace.len() as u8);
    for hop in &packet.route_trace {
        buf.extend_from_slice(hop);
    }
    buf.write_u16::<LittleEndian>(packet.payload.len() as u16)
        .expect("vec write");
    buf.extend_from_slice(&packet.payload);

    let crc = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(crc).expect("vec write");
    Ok(buf)
}

/// Decode a wire frame back into a packet.
pub fn decode(data: &[u8]) -> Result<Packet, FrameError> {
    if data.len() < FRAME_OVERHEAD {
        return Err(FrameError::Truncated);
    }

    // Checksum covers everything before the trailing 4 bytes.
    let body_len = data.len() - 4;
    let expected = {
        let mut tail = Cursor::new(&data[body_len..]);
        tail.read_u32::<LittleEndian>()
            .map_err(|_| FrameError::Truncated)?
    };
    let actual = crc32fast::hash(&data[..body_len]);
    if expected != actual {
        return Err(FrameError::BadCrc { expected, actual });
    }

    let mut cursor = Cursor::new(&data[..body_len]);

    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic).map_err(|_| FrameError::Truncated)?;
    if magic != PROTOCOL_MAGIC {
        return Err(FrameError::BadMagic);
    }

    let version = cursor.read_u8().map_err(|_| FrameError::Truncated)?;
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnknownVersion(version));
    }

    let type_byte = cursor.read_u8().map_err(|_| FrameError::Truncated)?;
    let packet_type =
        PacketType::from_wire(type_byte).ok_or(FrameError::UnknownPacketType(type_byte))?;
    let priority = cursor.read_u8().map_err(|_| FrameError::Truncated)?;
    let ttl = cursor.read_u8().map_err(|_| FrameError::Truncated)?;

    let mut packet_id = [0u8; 16];
    cursor
        .read_exact(&mut packet_id)
        .map_err(|_| FrameError::Truncated)?;
    let mut source = [0u8; 16];
    cursor
        .read_exact(&mut source)
        .map_err(|_| FrameError::Truncated)?;
    let mut destination = [0u8; 16];
    cursor
        .read_exact(&mut destination)
        .map_err(|_| FrameError::Truncated)?;

    let timestamp_ms = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| FrameError::Truncated)?;
    let flags = cursor.read_u8().map_err(|_| FrameError::Truncated)?;

    let trace_len = cursor.read_u8().map_err(|_| FrameError::Truncated)?;
    if trace_len > MAX_HOPS_LIMIT {
        return Err(FrameError::TraceTooLong(trace_len));
    }
    let mut route_trace = Vec::with_capacity(trace_len as usize);
    for _ in 0..trace_len {
        let mut hop: NodeId = [0u8; 16];
        cursor.read_exact(&mut hop).map_err(|_| FrameError::Truncated)?;
        route_trace.push(hop);
    }

    let payload_len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| FrameError::Truncated)? as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }
    let remaining = body_len - cursor.position() as usize;
    if remaining != payload_len {
        return Err(FrameError::Truncated);
    }
    let mut payload = vec![0u8; payload_len];
    cursor
        .read_exact(&mut payload)
        .map_err(|_| FrameError::Truncated)?;

    Ok(Packet {
        packet_id,
        packet_type,
        priority,
        ttl,
        source,
        destination,
        timestamp_ms,
        flags,
        route_trace,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BROADCAST;

    fn sample_packet() -> Packet {
        let mut pkt = Packet::originate(
            [0xAA; 16],
            BROADCAST,
            PacketType::Text,
            5,
            5,
            123_456,
            b"HELLO".to_vec(),
        );
        pkt.set_flag(FLAG_ENCRYPTED);
        pkt.record_hop([0xBB; 16]);
        pkt
    }

    #[test]
    fn roundtrip() {
        let pkt = sample_packet();
        let wire = encode(&pkt).unwrap();
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut wire = encode(&sample_packet()).unwrap();
        wire[0] = b'X';
        // fix up the checksum so the magic check is what fires
        let body = wire.len() - 4;
        let crc = crc32fast::hash(&wire[..body]);
        wire[body..].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(decode(&wire), Err(FrameError::BadMagic));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut wire = encode(&sample_packet()).unwrap();
        wire[4] = 99;
        let body = wire.len() - 4;
        let crc = crc32fast::hash(&wire[..body]);
        wire[body..].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(decode(&wire), Err(FrameError::UnknownVersion(99)));
    }

    #[test]
    fn rejects_corruption() {
        let mut wire = encode(&sample_packet()).unwrap();
        let mid = wire.len() / 2;
        wire[mid] ^= 0xFF;
        assert!(matches!(decode(&wire), Err(FrameError::BadCrc { .. })));
    }

    #[test]
    fn rejects_truncated() {
        let wire = encode(&sample_packet()).unwrap();
        assert_eq!(decode(&wire[..10]), Err(FrameError::Truncated));
        assert_eq!(decode(&[]), Err(FrameError::Truncated));
    }

    #[test]
    fn rejects_oversize_payload_on_encode() {
        let mut pkt = sample_packet();
        pkt.payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            encode(&pkt),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn rejects_oversize_trace_on_encode() {
        let mut pkt = sample_packet();
        pkt.route_trace = vec![[1u8; 16]; MAX_HOPS_LIMIT as usize + 1];
        assert!(matches!(encode(&pkt), Err(FrameError::TraceTooLong(_))));
    }

    #[test]
    fn empty_payload_roundtrip() {
        let pkt = Packet::originate(
            [1u8; 16],
            [2u8; 16],
            PacketType::Ack,
            0,
            5,
            0,
            Vec::new(),
        );
        let decoded = decode(&encode(&pkt).unwrap()).unwrap();
        assert_eq!(decoded, pkt);
    }
}
