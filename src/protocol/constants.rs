//! Protocol constants

/// Wire magic at the start of every frame
pub const PROTOCOL_MAGIC: [u8; 4] = *b"MSHR";

/// Current wire format version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default hop budget for normal transmissions
pub const DEFAULT_MAX_HOPS: u8 = 5;

/// Absolute upper clamp for the configurable hop budget
pub const MAX_HOPS_LIMIT: u8 = 10;

/// Maximum payload size accepted on the wire
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Fixed wire overhead excluding trace entries and payload:
/// magic + version + type + priority + ttl + packet_id + source +
/// destination + timestamp + flags + trace_len + payload_len + crc32
pub const FRAME_OVERHEAD: usize = 4 + 1 + 1 + 1 + 1 + 16 + 16 + 16 + 8 + 1 + 1 + 2 + 4;

// Flag bit positions
pub const FLAG_ENCRYPTED: u8 = 0x01; // Bit 0
pub const FLAG_EMERGENCY: u8 = 0x02; // Bit 1
// Bits 2-7 reserved

/// Default priority for voice and text transmissions
pub const PRIORITY_NORMAL: u8 = 5;

/// Priority reserved for emergency traffic
pub const PRIORITY_EMERGENCY: u8 = 10;

/// Highest priority value carried on the wire
pub const PRIORITY_MAX: u8 = 10;

/// Initial TTL for normal transmissions
pub const DEFAULT_TTL: u8 = 5;

/// Initial TTL for emergency transmissions
pub const EMERGENCY_TTL: u8 = 10;
