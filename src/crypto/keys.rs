//! Node key pair for pairwise key agreement.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 key pair generated at power-on. The secret never leaves this
/// struct; only the public half is serialized into pairing blobs.
pub struct NodeKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl NodeKeypair {
    /// Generate a fresh key pair from the OS entropy source.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Raw ECDH agreement with a peer's public key. Callers feed the result
    /// straight into the session KDF and drop it.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = PublicKey::from(*their_public);
        *self.secret.diffie_hellman(&their_public).as_bytes()
    }

    #[cfg(test)]
    pub fn from_bytes(secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}
