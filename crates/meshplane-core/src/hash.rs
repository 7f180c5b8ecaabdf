//! Convergence hashing.
//!
//! Client and server compare short fingerprints instead of retransmitting
//! artifacts. A hash is the hex MD5 of `serialize(artifact) || salt`, where
//! the salt is 32 random bytes chosen at process start. Because the salt
//! changes per process, hashes are not comparable across restarts — edges
//! re-sync on startup, which is intentional.

use md5::{Digest, Md5};
use rand::RngCore;
use serde::Serialize;

use crate::wire::WireError;

pub const SALT_LEN: usize = 32;

/// Per-process hash salt.
#[derive(Clone)]
pub struct HashSalt([u8; SALT_LEN]);

impl HashSalt {
    /// Fresh random salt. Called once at process start.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Fixed salt, for tests that need reproducible hashes.
    pub fn from_bytes(bytes: [u8; SALT_LEN]) -> Self {
        Self(bytes)
    }
}

/// Hex MD5 of `bytes || salt`.
pub fn convergence_hash(bytes: &[u8], salt: &HashSalt) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hasher.update(salt.0);
    hex::encode(hasher.finalize())
}

/// Serialize an artifact and hash it in one step.
///
/// Returns the serialized bytes alongside the hash so callers can cache the
/// exact representation the hash was computed over.
pub fn hash_artifact<T: Serialize>(
    artifact: &T,
    salt: &HashSalt,
) -> Result<(Vec<u8>, String), WireError> {
    let bytes = bincode::serialize(artifact)?;
    let hash = convergence_hash(&bytes, salt);
    Ok((bytes, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NextHopTable;

    fn salt() -> HashSalt {
        HashSalt::from_bytes([7u8; SALT_LEN])
    }

    #[test]
    fn hash_is_stable_for_equal_input() {
        let a = convergence_hash(b"roster", &salt());
        let b = convergence_hash(b"roster", &salt());
        assert_eq!(a, b);
        assert_eq!(a.len(), 32, "hex MD5 is 32 chars");
    }

    #[test]
    fn salt_changes_the_hash() {
        let a = convergence_hash(b"roster", &salt());
        let b = convergence_hash(b"roster", &HashSalt::from_bytes([8u8; SALT_LEN]));
        assert_ne!(a, b);
    }

    #[test]
    fn artifact_hash_tracks_content() {
        let mut table = NextHopTable::new();
        table.entry(1).or_default().insert(2, 2);
        let (bytes_a, hash_a) = hash_artifact(&table, &salt()).unwrap();

        table.entry(2).or_default().insert(1, 1);
        let (bytes_b, hash_b) = hash_artifact(&table, &salt()).unwrap();

        assert_ne!(bytes_a, bytes_b);
        assert_ne!(hash_a, hash_b);
    }
}
