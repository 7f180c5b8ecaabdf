//! The data-plane device seam.
//!
//! The supernode talks to edges through exactly two devices, one per
//! address family. The push engine iterates them as an ordered pair; there
//! is no wider dispatch hierarchy. Sends are fire-and-forget submissions —
//! retransmission is the job of the ticker fabric and the edges' own retry
//! loops.

use bytes::Bytes;

use meshplane_core::crypto::{PresharedKey, PublicKey};
use meshplane_core::Vertex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    pub fn label(&self) -> &'static str {
        match self {
            AddrFamily::V4 => "v4",
            AddrFamily::V6 => "v6",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device rejected peer: {0}")]
    Rejected(String),
}

/// One address family's control-channel device.
pub trait EdgeDevice: Send + Sync {
    fn family(&self) -> AddrFamily;

    /// Create tunnel state for a peer. Must not partially succeed.
    fn add_peer(
        &self,
        node_id: Vertex,
        pubkey: &PublicKey,
        psk: Option<&PresharedKey>,
    ) -> Result<(), DeviceError>;

    /// Drop tunnel state for a peer.
    fn remove_peer(&self, node_id: Vertex, pubkey: &str);

    /// Whether the device has any state for this peer.
    fn knows_peer(&self, pubkey: &str) -> bool;

    /// Whether this family currently has a resolved remote endpoint.
    fn endpoint_resolved(&self, pubkey: &str) -> bool;

    /// Non-blocking submission of one framed control datagram.
    fn send_control(&self, pubkey: &str, packet: Bytes);
}

/// In-memory device double for tests.
pub mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    /// Records every packet instead of sending it.
    pub struct MemoryDevice {
        family: AddrFamily,
        peers: Mutex<HashMap<String, Vertex>>,
        resolved: Mutex<HashSet<String>>,
        sent: Mutex<Vec<(String, Bytes)>>,
    }

    impl MemoryDevice {
        pub fn new(family: AddrFamily) -> Self {
            Self {
                family,
                peers: Mutex::new(HashMap::new()),
                resolved: Mutex::new(HashSet::new()),
                sent: Mutex::new(Vec::new()),
            }
        }

        /// Pretend the peer's endpoint became known on this family.
        pub fn resolve(&self, pubkey: &str) {
            self.resolved.lock().unwrap().insert(pubkey.to_string());
        }

        pub fn sent(&self) -> Vec<(String, Bytes)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_to(&self, pubkey: &str) -> Vec<Bytes> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == pubkey)
                .map(|(_, p)| p.clone())
                .collect()
        }

        pub fn clear_sent(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    impl EdgeDevice for MemoryDevice {
        fn family(&self) -> AddrFamily {
            self.family
        }

        fn add_peer(
            &self,
            node_id: Vertex,
            pubkey: &PublicKey,
            _psk: Option<&PresharedKey>,
        ) -> Result<(), DeviceError> {
            self.peers.lock().unwrap().insert(pubkey.to_base64(), node_id);
            Ok(())
        }

        fn remove_peer(&self, _node_id: Vertex, pubkey: &str) {
            self.peers.lock().unwrap().remove(pubkey);
            self.resolved.lock().unwrap().remove(pubkey);
        }

        fn knows_peer(&self, pubkey: &str) -> bool {
            self.peers.lock().unwrap().contains_key(pubkey)
        }

        fn endpoint_resolved(&self, pubkey: &str) -> bool {
            self.resolved.lock().unwrap().contains(pubkey)
        }

        fn send_control(&self, pubkey: &str, packet: Bytes) {
            self.sent.lock().unwrap().push((pubkey.to_string(), packet));
        }
    }
}
