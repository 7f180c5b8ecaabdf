//! Key material.
//!
//! Edges are identified by their static X25519 public key; the handshake
//! layer (external to this crate) proves possession. What lives here is
//! parsing and validation of the base64-encoded keys that appear in
//! configuration and admission requests, plus the supernode's own
//! per-family keypairs. Private key bytes are zeroized on drop.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("key is {0} bytes, expected {KEY_LEN}")]
    Length(usize),
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64.decode(encoded)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| KeyError::Length(len))
}

// ── Public key ───────────────────────────────────────────────────────────────

/// A peer's static X25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        decode_key(encoded).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

// ── Pre-shared key ───────────────────────────────────────────────────────────

/// Optional symmetric pre-shared key mixed into a peer's handshake.
#[derive(Clone)]
pub struct PresharedKey(Zeroizing<[u8; KEY_LEN]>);

impl PresharedKey {
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        decode_key(encoded).map(|bytes| Self(Zeroizing::new(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

// ── Supernode keypair ────────────────────────────────────────────────────────

/// One address family's static keypair. Lives for the process.
pub struct Keypair {
    private: Zeroizing<[u8; KEY_LEN]>,
    pub public: PublicKey,
}

impl Keypair {
    /// Reconstruct from the base64 private key in the configuration.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let private = decode_key(encoded)?;
        let public = XPublicKey::from(&StaticSecret::from(private));
        Ok(Self {
            private: Zeroizing::new(private),
            public: PublicKey(*public.as_bytes()),
        })
    }

    /// Generate a fresh keypair (used by `--example-config`).
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = XPublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: PublicKey(*public.as_bytes()),
        }
    }

    pub fn private_base64(&self) -> String {
        BASE64.encode(*self.private)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_valid_key() {
        let pair = Keypair::generate();
        let encoded = pair.public.to_base64();
        let decoded = PublicKey::from_base64(&encoded).unwrap();
        assert_eq!(decoded, pair.public);
    }

    #[test]
    fn keypair_round_trips_through_base64() {
        let pair = Keypair::generate();
        let restored = Keypair::from_base64(&pair.private_base64()).unwrap();
        assert_eq!(restored.public, pair.public);
    }

    #[test]
    fn rejects_garbage_and_short_keys() {
        assert!(matches!(
            PublicKey::from_base64("not base64 at all!"),
            Err(KeyError::Base64(_))
        ));
        assert!(matches!(
            PublicKey::from_base64(&BASE64.encode([0u8; 16])),
            Err(KeyError::Length(16))
        ));
    }
}
