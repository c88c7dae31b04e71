//! Pairing blobs and verification codes.
//!
//! A pairing blob is the out-of-band bootstrap: unpadded base64 of
//! `version:1 | device_id:16 | key_len:2 | public_key | monotonic_ms:8`
//! (little-endian). Blobs expire 5 minutes after their embedded timestamp.
//! The 6-character verification code both sides compare out-of-band is the
//! first 6 base64 characters of HMAC-SHA256(session_secret,
//! peer_id || created_ms).

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io::{Cursor, Read};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::protocol::NodeId;

type HmacSha256 = Hmac<Sha256>;

const BLOB_VERSION: u8 = 1;

/// How long a pairing blob stays ingestible after creation
pub const PAIRING_BLOB_TTL_MS: u64 = 5 * 60 * 1000;

/// Number of characters in a verification code
pub const VERIFICATION_CODE_LEN: usize = 6;

/// Decoded pairing blob contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingBlob {
    pub device_id: NodeId,
    pub public_key: [u8; 32],
    pub created_ms: u64,
}

impl PairingBlob {
    pub fn new(device_id: NodeId, public_key: [u8; 32], created_ms: u64) -> Self {
        Self {
            device_id,
            public_key,
            created_ms,
        }
    }

    /// Serialize to the textual form exchanged out-of-band.
    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(1 + 16 + 2 + 32 + 8);
        buf.push(BLOB_VERSION);
        buf.extend_from_slice(&self.device_id);
        buf.write_u16::<LittleEndian>(self.public_key.len() as u16)
            .expect("vec write");
        buf.extend_from_slice(&self.public_key);
        buf.write_u64::<LittleEndian>(self.created_ms)
            .expect("vec write");
        STANDARD_NO_PAD.encode(buf)
    }

    /// Parse a blob; structural errors only, freshness is checked by the
    /// caller against its own clock.
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = STANDARD_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| Error::DecodePairingBlob(format!("base64: {}", e)))?;
        let mut cursor = Cursor::new(bytes.as_slice());

        let version = cursor
            .read_u8()
            .map_err(|_| Error::DecodePairingBlob("short blob".into()))?;
        if version != BLOB_VERSION {
            return Err(Error::DecodePairingBlob(format!(
                "unsupported version {}",
                version
            )));
        }

        let mut device_id: NodeId = [0u8; 16];
        cursor
            .read_exact(&mut device_id)
            .map_err(|_| Error::DecodePairingBlob("short blob".into()))?;

        let key_len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::DecodePairingBlob("short blob".into()))?;
        if key_len != 32 {
            return Err(Error::DecodePairingBlob(format!(
                "unexpected key length {}",
                key_len
            )));
        }
        let mut public_key = [0u8; 32];
        cursor
            .read_exact(&mut public_key)
            .map_err(|_| Error::DecodePairingBlob("short blob".into()))?;

        let created_ms = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::DecodePairingBlob("short blob".into()))?;
        if cursor.position() as usize != bytes.len() {
            return Err(Error::DecodePairingBlob("trailing bytes".into()));
        }

        Ok(Self {
            device_id,
            public_key,
            created_ms,
        })
    }

    /// True once the recipient's clock has moved past the ingest window.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_ms) > PAIRING_BLOB_TTL_MS
    }
}

/// Derive the 6-character verification code for a bond.
///
/// Both sides must land on the same string, so the MAC input is the
/// lexicographically ordered id pair rather than either side's view of
/// "the peer".
pub fn verification_code(session_secret: &[u8; 32], id_a: &NodeId, id_b: &NodeId) -> String {
    let (lo, hi) = if id_a <= id_b { (id_a, id_b) } else { (id_b, id_a) };
    let mut mac =
        HmacSha256::new_from_slice(session_secret).expect("HMAC accepts any key length");
    mac.update(lo);
    mac.update(hi);
    let digest = mac.finalize().into_bytes();
    STANDARD.encode(digest)[..VERIFICATION_CODE_LEN].to_string()
}

/// Constant-time code comparison.
pub fn codes_match(expected: &str, presented: &str) -> bool {
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into()
}
