//! Session key derivation and payload sealing.

use chacha20poly1305::aead::{generic_array::GenericArray, Aead};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const HKDF_INFO: &[u8] = b"meshradio session v1";

/// Derive the 32-byte session key from raw ECDH output.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; SESSION_KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; SESSION_KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Seal a payload under a session key with a fresh random nonce.
pub fn seal_payload(
    session_key: &[u8; SESSION_KEY_LEN],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(session_key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::AuthFailed)?;
    Ok((ciphertext, nonce_bytes))
}

/// Open a sealed payload. Fails with `AuthFailed` on any tampering or key
/// mismatch; callers drop the packet and bump a counter.
pub fn open_payload(
    session_key: &[u8; SESSION_KEY_LEN],
    ciphertext: &[u8],
    nonce_bytes: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(session_key));
    let nonce = GenericArray::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::AuthFailed)
}
