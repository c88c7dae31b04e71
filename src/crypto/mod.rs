//! Cryptography for pair-bonded communication.
//!
//! Key agreement is static-static X25519; the raw shared secret runs
//! through HKDF-SHA256 into a 32-byte session key; payloads are sealed with
//! ChaCha20-Poly1305 under a random 96-bit nonce; pairing verification
//! codes are truncated HMAC-SHA256. All failure modes map to
//! `NotPaired` / `AuthFailed` / `DecodePairingBlob` and are never escalated
//! past a counter for inbound traffic.

pub mod keys;
pub mod pairing;
pub mod session;

pub use keys::NodeKeypair;
pub use pairing::{PairingBlob, PAIRING_BLOB_TTL_MS};
pub use session::{derive_session_key, open_payload, seal_payload, NONCE_LEN, SESSION_KEY_LEN};
