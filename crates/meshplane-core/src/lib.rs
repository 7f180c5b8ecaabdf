//! meshplane-core — shared types, wire format, convergence hashing, and
//! configuration. All other meshplane crates depend on this one.

pub mod config;
pub mod crypto;
pub mod event;
pub mod hash;
pub mod wire;

use std::collections::BTreeMap;

/// Logical vertex ID of an overlay node.
///
/// Peer IDs are strictly below [`SUPER_ID`]; IDs at or above it are reserved
/// for supernode-originated control traffic and are never routing
/// destinations.
pub type Vertex = u16;

/// First reserved vertex ID. The supernode stamps its own frames with this.
pub const SUPER_ID: Vertex = 0xff00;

/// All-pairs next-hop table: `table[src][dst]` is the neighbour `src`
/// forwards through to reach `dst`. Unreachable pairs are absent.
///
/// BTreeMap keeps iteration (and therefore the serialized artifact) in a
/// defined order, which the convergence hashes depend on.
pub type NextHopTable = BTreeMap<Vertex, BTreeMap<Vertex, Vertex>>;
