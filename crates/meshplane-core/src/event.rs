//! Dispatcher inputs — the two typed events the handshake/UDP layer feeds
//! into the supernode, plus the sentinel constructors the ticker fabric
//! uses to drive periodic sweeps through the same channels.

use serde::{Deserialize, Serialize};

use crate::{Vertex, SUPER_ID};

/// Opaque per-peer token, replaced on every register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeToken(pub [u8; 32]);

/// Periodic liveness/state report from an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterEvent {
    pub node_id: Vertex,
    pub jwt_secret: EdgeToken,
    pub http_post_count: u64,
    /// Hash of the next-hop table the edge currently holds.
    pub nh_state_hash: String,
    /// Hash of the peer roster the edge currently holds.
    pub peer_state_hash: String,
    /// Hash of the runtime parameters the edge currently holds.
    pub super_param_state_hash: String,
    /// Edge software version, informational only.
    pub version: String,
}

impl RegisterEvent {
    /// Ticker sentinel: drives a roster sweep without touching any record.
    pub fn sentinel() -> Self {
        Self {
            node_id: SUPER_ID,
            ..Self::default()
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.node_id >= SUPER_ID
    }
}

/// One latency measurement between two edges, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PongEvent {
    pub request_id: u64,
    pub src_node_id: Vertex,
    pub dst_node_id: Vertex,
    /// Measured one-way latency, seconds.
    pub timediff: f64,
    /// How long the measurement stays valid, seconds.
    pub time_to_alive: f64,
    /// Cost bias the destination reported for itself.
    pub additional_cost: f64,
}

impl PongEvent {
    /// Ticker sentinel: drives an expiry sweep and any deferred recompute.
    pub fn sentinel() -> Self {
        Self {
            src_node_id: SUPER_ID,
            dst_node_id: SUPER_ID,
            ..Self::default()
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.src_node_id >= SUPER_ID || self.dst_node_id >= SUPER_ID
    }
}
