//! Process-wide shared state and peer admission.
//!
//! A single [`Supernode`] value is threaded through every task spawn; there
//! is no ambient global. The registry lock is the supernode lock of the
//! concurrency model: admission and removal take it exclusively, everything
//! else takes it shared and mutates only per-record cells. The graph and
//! the artifact cache sit behind their own mutexes, always acquired after
//! the registry lock.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshplane_core::config::{PeerConfig, SuperConfig};
use meshplane_core::crypto::{KeyError, PresharedKey, PublicKey};
use meshplane_core::hash::{hash_artifact, HashSalt};
use meshplane_core::wire::{
    encode_frame, ControlPayload, ServerCommand, UpdateAction, WireError, CODE_PEER_REMOVED,
};
use meshplane_core::{NextHopTable, Vertex, SUPER_ID};

use crate::device::{DeviceError, EdgeDevice};
use crate::graph::LatencyGraph;
use crate::registry::{EdgeRecord, Registry};

/// How many shutdown notifications a removed peer gets, and how far apart.
pub const SHUTDOWN_NOTIFY_COUNT: u32 = 10;
pub const SHUTDOWN_NOTIFY_SPACING: Duration = Duration::from_millis(100);

/// Runtime parameters pushed to one edge. Hashed per peer because
/// `additional_cost` differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperParams {
    pub send_ping_interval: f64,
    pub http_post_interval: f64,
    pub peer_alive_timeout: f64,
    pub additional_cost: f64,
}

/// Cached serialized artifacts and their convergence hashes. These are the
/// exact bytes the hashes were computed over.
#[derive(Default)]
pub(crate) struct Artifacts {
    pub nh_bytes: Vec<u8>,
    pub nh_hash: String,
    pub peer_bytes: Vec<u8>,
    pub peer_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("node id {0} is reserved for supernode traffic")]
    ReservedNodeId(Vertex),

    #[error("node id {0} is already admitted")]
    DuplicateNodeId(Vertex),

    #[error("public key {0} is already admitted")]
    DuplicatePubkey(String),

    #[error("peer {name}: bad public key: {source}")]
    BadKey { name: String, source: KeyError },

    #[error("peer {name}: bad pre-shared key: {source}")]
    BadPsk { name: String, source: KeyError },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("failed to hash peer parameters: {0}")]
    Hash(#[from] WireError),
}

pub struct Supernode {
    pub cfg: SuperConfig,
    salt: HashSalt,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) graph: Mutex<LatencyGraph>,
    pub(crate) artifacts: Mutex<Artifacts>,
    devices: Vec<Arc<dyn EdgeDevice>>,
}

impl Supernode {
    /// Build the shared state and admit the configured roster. The config
    /// must already be validated.
    pub fn new(
        cfg: SuperConfig,
        devices: Vec<Arc<dyn EdgeDevice>>,
    ) -> Result<Arc<Self>, AdmissionError> {
        let mut graph = LatencyGraph::new(&cfg.graph);
        if let Some(table) = &cfg.next_hop_table {
            graph.set_nh_table(table.clone());
        }

        let node = Arc::new(Self {
            cfg,
            salt: HashSalt::generate(),
            registry: RwLock::new(Registry::new()),
            graph: Mutex::new(graph),
            artifacts: Mutex::new(Artifacts::default()),
            devices,
        });

        for peer in node.cfg.peers.clone() {
            node.admit_peer(peer)?;
        }

        // Seed both artifacts so pushes have hashes to name from the start.
        let table = node.graph.lock().unwrap().nh_table().clone();
        node.store_nh_artifact(&table)?;
        let registry = node.registry.read().unwrap();
        node.refresh_roster(&registry);
        drop(registry);

        Ok(node)
    }

    pub fn salt(&self) -> &HashSalt {
        &self.salt
    }

    pub fn devices(&self) -> &[Arc<dyn EdgeDevice>] {
        &self.devices
    }

    /// Shared view of the registry.
    pub fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap()
    }

    pub fn is_alive(&self, record: &EdgeRecord) -> bool {
        record.is_alive(self.cfg.peer_alive_timeout)
    }

    pub fn super_params_for(&self, additional_cost: f64) -> SuperParams {
        SuperParams {
            send_ping_interval: self.cfg.send_ping_interval,
            http_post_interval: self.cfg.http_post_interval,
            peer_alive_timeout: self.cfg.peer_alive_timeout,
            additional_cost,
        }
    }

    pub fn nh_hash(&self) -> String {
        self.artifacts.lock().unwrap().nh_hash.clone()
    }

    pub fn peer_hash(&self) -> String {
        self.artifacts.lock().unwrap().peer_hash.clone()
    }

    pub fn nh_table(&self) -> NextHopTable {
        self.graph.lock().unwrap().nh_table().clone()
    }

    /// Hash and cache a new next-hop artifact; returns its hash.
    pub(crate) fn store_nh_artifact(&self, table: &NextHopTable) -> Result<String, WireError> {
        let (bytes, hash) = hash_artifact(table, &self.salt)?;
        let mut artifacts = self.artifacts.lock().unwrap();
        artifacts.nh_bytes = bytes;
        artifacts.nh_hash = hash.clone();
        Ok(hash)
    }

    /// Re-serialize the roster and refresh its hash. Returns whether the
    /// hash changed since the last refresh.
    pub fn refresh_roster(&self, registry: &Registry) -> bool {
        let roster = registry.roster();
        let (bytes, hash) = match hash_artifact(&roster, &self.salt) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "roster serialization failed");
                return false;
            }
        };
        let mut artifacts = self.artifacts.lock().unwrap();
        let changed = artifacts.peer_hash != hash;
        if changed {
            artifacts.peer_bytes = bytes;
            artifacts.peer_hash = hash;
        }
        changed
    }

    // ── Admission ────────────────────────────────────────────────────────────

    /// Validate and admit one peer: keys checked, tunnel state created on
    /// every enabled family, record seeded with empty acked hashes. No
    /// partial insert on failure.
    pub fn admit_peer(&self, peer: PeerConfig) -> Result<(), AdmissionError> {
        if peer.node_id >= SUPER_ID {
            return Err(AdmissionError::ReservedNodeId(peer.node_id));
        }
        let pubkey = PublicKey::from_base64(&peer.pubkey).map_err(|source| {
            AdmissionError::BadKey {
                name: peer.name.clone(),
                source,
            }
        })?;
        let psk = peer
            .psk
            .as_deref()
            .map(PresharedKey::from_base64)
            .transpose()
            .map_err(|source| AdmissionError::BadPsk {
                name: peer.name.clone(),
                source,
            })?;

        let params = self.super_params_for(peer.additional_cost);
        let (_, params_hash) = hash_artifact(&params, &self.salt)?;

        let mut registry = self.registry.write().unwrap();
        if registry.contains_id(peer.node_id) {
            return Err(AdmissionError::DuplicateNodeId(peer.node_id));
        }
        if registry.contains_key(&peer.pubkey) {
            return Err(AdmissionError::DuplicatePubkey(peer.pubkey.clone()));
        }

        let mut added: Vec<&Arc<dyn EdgeDevice>> = Vec::new();
        for device in &self.devices {
            if let Err(e) = device.add_peer(peer.node_id, &pubkey, psk.as_ref()) {
                for earlier in added {
                    earlier.remove_peer(peer.node_id, &peer.pubkey);
                }
                return Err(e.into());
            }
            added.push(device);
        }

        let record = Arc::new(EdgeRecord::new(
            peer.node_id,
            peer.pubkey.clone(),
            params_hash,
        ));
        tracing::info!(node_id = peer.node_id, name = %peer.name, "peer admitted");
        registry.insert(peer, record);
        Ok(())
    }

    /// Remove a peer from both indexes, then notify it asynchronously before
    /// tearing down tunnel state and graph edges. Returns false when the id
    /// was not admitted.
    pub fn remove_peer(self: &Arc<Self>, node_id: Vertex) -> bool {
        let removed = self.registry.write().unwrap().remove(node_id);
        let Some((peer, _record)) = removed else {
            return false;
        };
        tracing::info!(node_id, name = %peer.name, "peer removed");

        let node = self.clone();
        tokio::spawn(async move {
            node.notify_removed(node_id, peer.pubkey).await;
        });
        true
    }

    /// Best-effort burst of shutdown notifications, then data-plane and
    /// graph teardown.
    async fn notify_removed(&self, node_id: Vertex, pubkey: String) {
        let command = ServerCommand {
            node_id,
            action: UpdateAction::Shutdown,
            code: CODE_PEER_REMOVED,
            params: "removed from supernode".into(),
        };
        match encode_frame(SUPER_ID, node_id, &ControlPayload::Update(command)) {
            Ok(packet) => {
                for _ in 0..SHUTDOWN_NOTIFY_COUNT {
                    for device in &self.devices {
                        if device.knows_peer(&pubkey) {
                            device.send_control(&pubkey, packet.clone());
                        }
                    }
                    tokio::time::sleep(SHUTDOWN_NOTIFY_SPACING).await;
                }
            }
            Err(e) => tracing::warn!(node_id, error = %e, "failed to encode shutdown notice"),
        }

        for device in &self.devices {
            device.remove_peer(node_id, &pubkey);
        }
        self.graph.lock().unwrap().remove_vertex(node_id);
        tracing::debug!(node_id, "tunnel state and graph vertex dropped");
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::MemoryDevice;
    use crate::device::AddrFamily;
    use meshplane_core::crypto::Keypair;

    fn peer(node_id: Vertex) -> PeerConfig {
        PeerConfig {
            node_id,
            name: format!("node_{node_id:02}"),
            pubkey: Keypair::generate().public.to_base64(),
            psk: None,
            additional_cost: 0.0,
        }
    }

    fn build(peers: Vec<PeerConfig>) -> (Arc<Supernode>, Arc<MemoryDevice>) {
        let device = Arc::new(MemoryDevice::new(AddrFamily::V4));
        let cfg = SuperConfig {
            peers,
            ..SuperConfig::default()
        };
        let node = Supernode::new(cfg, vec![device.clone()]).unwrap();
        (node, device)
    }

    #[test]
    fn admission_seeds_record_and_device() {
        let (node, device) = build(vec![peer(1), peer(2)]);
        let registry = node.registry();
        assert_eq!(registry.len(), 2);

        let record = registry.record_for_id(1).unwrap();
        assert_eq!(record.nh_hash_acked(), "");
        assert_eq!(record.last_seen_millis(), 0);
        assert_ne!(record.params_hash(), "");
        assert!(device.knows_peer(&record.pubkey));
    }

    #[test]
    fn admission_rejects_duplicates_and_reserved_ids() {
        let (node, _) = build(vec![peer(1)]);

        let mut dup = peer(3);
        dup.node_id = 1;
        assert!(matches!(
            node.admit_peer(dup),
            Err(AdmissionError::DuplicateNodeId(1))
        ));

        let existing_key = node.registry().peer(1).unwrap().pubkey.clone();
        let mut dup_key = peer(4);
        dup_key.pubkey = existing_key;
        assert!(matches!(
            node.admit_peer(dup_key),
            Err(AdmissionError::DuplicatePubkey(_))
        ));

        let mut reserved = peer(5);
        reserved.node_id = SUPER_ID;
        assert!(matches!(
            node.admit_peer(reserved),
            Err(AdmissionError::ReservedNodeId(_))
        ));
        assert_eq!(node.registry().len(), 1, "no partial inserts");
    }

    #[test]
    fn admission_rejects_malformed_keys() {
        let (node, _) = build(vec![]);
        let mut bad = peer(1);
        bad.pubkey = "***".into();
        assert!(matches!(node.admit_peer(bad), Err(AdmissionError::BadKey { .. })));

        let mut bad_psk = peer(2);
        bad_psk.psk = Some("***".into());
        assert!(matches!(
            node.admit_peer(bad_psk),
            Err(AdmissionError::BadPsk { .. })
        ));
        assert!(node.registry().is_empty());
    }

    #[test]
    fn params_hash_differs_per_additional_cost() {
        let mut expensive = peer(2);
        expensive.additional_cost = 10.0;
        let (node, _) = build(vec![peer(1), expensive]);
        let registry = node.registry();
        assert_ne!(
            registry.record_for_id(1).unwrap().params_hash(),
            registry.record_for_id(2).unwrap().params_hash()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn removal_sends_ten_spaced_shutdown_notices() {
        use meshplane_core::wire::decode_frame;

        let (node, device) = build(vec![peer(1), peer(2)]);
        let pubkey = node.registry().peer(2).unwrap().pubkey.clone();

        assert!(node.remove_peer(2));
        assert!(!node.remove_peer(2), "second removal is a no-op");
        assert!(!node.registry().contains_id(2));

        // Let the notify task run its full burst.
        tokio::time::sleep(Duration::from_secs(2)).await;

        let packets = device.sent_to(&pubkey);
        assert_eq!(packets.len(), SHUTDOWN_NOTIFY_COUNT as usize);
        for packet in &packets {
            let (header, payload) = decode_frame(packet).unwrap();
            assert_eq!(header.dst.get(), 2);
            match payload {
                ControlPayload::Update(cmd) => {
                    assert_eq!(cmd.action, UpdateAction::Shutdown);
                    assert_eq!(cmd.code, CODE_PEER_REMOVED);
                }
                other => panic!("unexpected payload: {other:?}"),
            }
        }

        // Tunnel state dropped only after the burst.
        assert!(!device.knows_peer(&pubkey));
    }
}
