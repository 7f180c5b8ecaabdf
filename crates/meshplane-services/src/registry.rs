//! The edge registry.
//!
//! One record per admitted peer, reachable from both the node-id index and
//! the pubkey index. Structural changes (insert/remove) need the exclusive
//! supernode lock; the per-record fields that churn on every register —
//! timestamps, counters, hash cells — are independent atomics/mutexes so
//! the dispatcher can write them at high rate under the shared lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use meshplane_core::config::PeerConfig;
use meshplane_core::event::EdgeToken;
use meshplane_core::Vertex;

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Edge record ──────────────────────────────────────────────────────────────

/// Per-peer runtime state. All fields here are written under the shared
/// registry lock; only creating or destroying the record itself requires
/// the exclusive lock.
pub struct EdgeRecord {
    pub node_id: Vertex,
    pub pubkey: String,
    /// Milliseconds since epoch of the last register; 0 = never seen.
    last_seen_ms: AtomicU64,
    http_post_count: AtomicU64,
    jwt_secret: Mutex<EdgeToken>,
    /// Next-hop table hash the edge last told us it holds.
    nh_hash_acked: Mutex<String>,
    /// Roster hash the edge last told us it holds.
    peer_hash_acked: Mutex<String>,
    /// Runtime-parameter hash the edge last told us it holds.
    params_hash_acked: Mutex<String>,
    /// Our hash of this edge's runtime parameters.
    params_hash: Mutex<String>,
}

impl EdgeRecord {
    pub fn new(node_id: Vertex, pubkey: String, params_hash: String) -> Self {
        Self {
            node_id,
            pubkey,
            last_seen_ms: AtomicU64::new(0),
            http_post_count: AtomicU64::new(0),
            jwt_secret: Mutex::new(EdgeToken::default()),
            nh_hash_acked: Mutex::new(String::new()),
            peer_hash_acked: Mutex::new(String::new()),
            params_hash_acked: Mutex::new(String::new()),
            params_hash: Mutex::new(params_hash),
        }
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn last_seen_millis(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    /// `last_seen + peer_alive_timeout > now`. A never-seen record is dead.
    pub fn is_alive(&self, peer_alive_timeout: f64) -> bool {
        let last_seen = self.last_seen_millis();
        if last_seen == 0 {
            return false;
        }
        last_seen + (peer_alive_timeout * 1000.0) as u64 > unix_millis()
    }

    pub fn set_jwt_secret(&self, secret: EdgeToken) {
        *self.jwt_secret.lock().unwrap() = secret;
    }

    pub fn jwt_secret(&self) -> EdgeToken {
        *self.jwt_secret.lock().unwrap()
    }

    pub fn set_http_post_count(&self, count: u64) {
        self.http_post_count.store(count, Ordering::Relaxed);
    }

    pub fn http_post_count(&self) -> u64 {
        self.http_post_count.load(Ordering::Relaxed)
    }

    pub fn nh_hash_acked(&self) -> String {
        self.nh_hash_acked.lock().unwrap().clone()
    }

    pub fn set_nh_hash_acked(&self, hash: String) {
        *self.nh_hash_acked.lock().unwrap() = hash;
    }

    pub fn peer_hash_acked(&self) -> String {
        self.peer_hash_acked.lock().unwrap().clone()
    }

    pub fn set_peer_hash_acked(&self, hash: String) {
        *self.peer_hash_acked.lock().unwrap() = hash;
    }

    pub fn params_hash_acked(&self) -> String {
        self.params_hash_acked.lock().unwrap().clone()
    }

    pub fn set_params_hash_acked(&self, hash: String) {
        *self.params_hash_acked.lock().unwrap() = hash;
    }

    pub fn params_hash(&self) -> String {
        self.params_hash.lock().unwrap().clone()
    }

    pub fn set_params_hash(&self, hash: String) {
        *self.params_hash.lock().unwrap() = hash;
    }
}

// ── Roster ───────────────────────────────────────────────────────────────────

/// The subset of peer state an edge needs to dial its neighbours. Runtime
/// fields (timestamps, counters) stay out so the serialized roster only
/// changes when membership does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterPeer {
    pub node_id: Vertex,
    pub name: String,
    pub pubkey: String,
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Dual-index peer registry. Both indexes are kept consistent: every
/// admitted peer is reachable by node id and by pubkey, or not at all.
#[derive(Default)]
pub struct Registry {
    by_id: HashMap<Vertex, PeerConfig>,
    by_key: HashMap<String, Arc<EdgeRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: PeerConfig, record: Arc<EdgeRecord>) {
        self.by_key.insert(peer.pubkey.clone(), record);
        self.by_id.insert(peer.node_id, peer);
    }

    pub fn remove(&mut self, node_id: Vertex) -> Option<(PeerConfig, Arc<EdgeRecord>)> {
        let peer = self.by_id.remove(&node_id)?;
        let record = self.by_key.remove(&peer.pubkey)?;
        Some((peer, record))
    }

    pub fn peer(&self, node_id: Vertex) -> Option<&PeerConfig> {
        self.by_id.get(&node_id)
    }

    pub fn record(&self, pubkey: &str) -> Option<&Arc<EdgeRecord>> {
        self.by_key.get(pubkey)
    }

    pub fn record_for_id(&self, node_id: Vertex) -> Option<&Arc<EdgeRecord>> {
        self.by_id
            .get(&node_id)
            .and_then(|peer| self.by_key.get(&peer.pubkey))
    }

    pub fn contains_id(&self, node_id: Vertex) -> bool {
        self.by_id.contains_key(&node_id)
    }

    pub fn contains_key(&self, pubkey: &str) -> bool {
        self.by_key.contains_key(pubkey)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &Arc<EdgeRecord>)> {
        self.by_key.iter()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerConfig> {
        self.by_id.values()
    }

    /// Current roster, sorted by node id so serialization is deterministic.
    pub fn roster(&self) -> Vec<RosterPeer> {
        let mut roster: Vec<RosterPeer> = self
            .by_id
            .values()
            .map(|p| RosterPeer {
                node_id: p.node_id,
                name: p.name.clone(),
                pubkey: p.pubkey.clone(),
            })
            .collect();
        roster.sort_by_key(|p| p.node_id);
        roster
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
