//! Supernode configuration.
//!
//! Loaded once at startup from a TOML file; every validation failure is
//! fatal and reported before the daemon touches the network. Graph tuning
//! lives in its own `[graph]` table, peers in `[[peers]]` entries.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto::{PresharedKey, PublicKey};
use crate::{NextHopTable, Vertex, SUPER_ID};

/// Longest node name the control channel will carry.
pub const MAX_NODE_NAME: usize = 32;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperConfig {
    pub node_name: String,
    /// Shell command run once after startup; failure is fatal.
    pub post_script: String,
    /// Base64 private key for the IPv4 control device. Empty disables the family.
    pub priv_key_v4: String,
    /// Base64 private key for the IPv6 control device. Empty disables the family.
    pub priv_key_v6: String,
    /// UDP port both control devices listen on.
    pub listen_port: u16,
    /// TCP port for the HTTP pull API.
    pub api_port: u16,
    /// Path prefix the API is mounted under.
    pub api_prefix: String,
    /// Forced full re-push cadence, seconds.
    pub re_push_interval: f64,
    /// Liveness horizon, seconds.
    pub peer_alive_timeout: f64,
    /// Advisory HTTP post cadence handed to edges, seconds.
    pub http_post_interval: f64,
    /// Advisory ping cadence handed to edges, seconds.
    pub send_ping_interval: f64,
    pub passwords: Passwords,
    pub graph: GraphSettings,
    /// Initial next-hop table; required (and validated) in static mode.
    #[serde(with = "nh_table_keys", skip_serializing_if = "Option::is_none")]
    pub next_hop_table: Option<NextHopTable>,
    pub peers: Vec<PeerConfig>,
}

/// Per-operation passwords for the manage API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Passwords {
    pub show_state: String,
    pub add_peer: String,
    pub del_peer: String,
}

/// Latency-graph tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    /// Fixed next-hop table, never recomputed.
    pub static_mode: bool,
    /// Hysteresis half-width, seconds.
    pub jitter_tolerance: f64,
    /// Hysteresis multiplier, ≥ 1.
    pub jitter_tolerance_multiplier: f64,
    /// Timeout-ticker period, seconds.
    pub timeout_check_interval: f64,
    /// Minimum seconds between next-hop recomputations.
    pub recalculate_cooldown: f64,
}

/// One admitted (or to-be-admitted) peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: Vertex,
    pub name: String,
    /// Base64 X25519 public key.
    pub pubkey: String,
    /// Optional base64 pre-shared key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    /// Latency bias added to all edges toward this node; negative means
    /// "trust the remote's self-reported cost".
    #[serde(default)]
    pub additional_cost: f64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for SuperConfig {
    fn default() -> Self {
        Self {
            node_name: "meshplane".into(),
            post_script: String::new(),
            priv_key_v4: String::new(),
            priv_key_v6: String::new(),
            listen_port: 3000,
            api_port: 3000,
            api_prefix: "/api".into(),
            re_push_interval: 30.0,
            peer_alive_timeout: 70.0,
            http_post_interval: 50.0,
            send_ping_interval: 15.0,
            passwords: Passwords::default(),
            graph: GraphSettings::default(),
            next_hop_table: None,
            peers: Vec::new(),
        }
    }
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            static_mode: false,
            jitter_tolerance: 5.0,
            jitter_tolerance_multiplier: 1.01,
            timeout_check_interval: 5.0,
            recalculate_cooldown: 5.0,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),

    #[error("node name can't be longer than {MAX_NODE_NAME} bytes: {0:?}")]
    NodeNameTooLong(String),

    #[error("{name} must be > 0, got {value}")]
    NonPositiveInterval { name: &'static str, value: f64 },

    #[error("http_post_interval must be >= 0, got {0}")]
    NegativeHttpPostInterval(f64),

    #[error("http_post_interval ({http_post_interval}) must be <= peer_alive_timeout ({peer_alive_timeout})")]
    HttpPostIntervalExceedsTimeout {
        http_post_interval: f64,
        peer_alive_timeout: f64,
    },

    #[error("jitter_tolerance_multiplier must be >= 1, got {0}")]
    JitterMultiplierBelowOne(f64),

    #[error("node id {0} is reserved for supernode traffic")]
    ReservedNodeId(Vertex),

    #[error("duplicate node id {0}")]
    DuplicateNodeId(Vertex),

    #[error("duplicate public key {0}")]
    DuplicatePubkey(String),

    #[error("peer {name}: bad public key: {source}")]
    BadPeerKey {
        name: String,
        source: crate::crypto::KeyError,
    },

    #[error("peer {name}: bad pre-shared key: {source}")]
    BadPeerPsk {
        name: String,
        source: crate::crypto::KeyError,
    },

    #[error("static mode requires a next_hop_table")]
    StaticTableMissing,

    #[error("next_hop_table[{src}][{dst}] not found")]
    StaticTableIncomplete { src: Vertex, dst: Vertex },

    #[error("next_hop_table[{src}][{dst}] = {hop}, which is not in the peer list")]
    StaticTableForeignHop { src: Vertex, dst: Vertex, hop: Vertex },

    #[error("next_hop_table key {0:?} is not a vertex id")]
    BadTableKey(String),
}

// ── Loading & validation ─────────────────────────────────────────────────────

impl SuperConfig {
    /// Read and parse a config file. Validation is a separate step so the
    /// daemon can report all context (path, field) distinctly.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Every check here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.len() > MAX_NODE_NAME {
            return Err(ConfigError::NodeNameTooLong(self.node_name.clone()));
        }
        if self.peer_alive_timeout <= 0.0 {
            return Err(ConfigError::NonPositiveInterval {
                name: "peer_alive_timeout",
                value: self.peer_alive_timeout,
            });
        }
        if self.http_post_interval < 0.0 {
            return Err(ConfigError::NegativeHttpPostInterval(self.http_post_interval));
        }
        if self.http_post_interval > self.peer_alive_timeout {
            return Err(ConfigError::HttpPostIntervalExceedsTimeout {
                http_post_interval: self.http_post_interval,
                peer_alive_timeout: self.peer_alive_timeout,
            });
        }
        if self.send_ping_interval <= 0.0 {
            return Err(ConfigError::NonPositiveInterval {
                name: "send_ping_interval",
                value: self.send_ping_interval,
            });
        }
        if self.re_push_interval <= 0.0 {
            return Err(ConfigError::NonPositiveInterval {
                name: "re_push_interval",
                value: self.re_push_interval,
            });
        }
        if self.graph.jitter_tolerance_multiplier < 1.0 {
            return Err(ConfigError::JitterMultiplierBelowOne(
                self.graph.jitter_tolerance_multiplier,
            ));
        }

        let mut seen_ids = HashSet::new();
        let mut seen_keys = HashSet::new();
        for peer in &self.peers {
            peer.validate_keys()?;
            if peer.node_id >= SUPER_ID {
                return Err(ConfigError::ReservedNodeId(peer.node_id));
            }
            if !seen_ids.insert(peer.node_id) {
                return Err(ConfigError::DuplicateNodeId(peer.node_id));
            }
            if !seen_keys.insert(peer.pubkey.clone()) {
                return Err(ConfigError::DuplicatePubkey(peer.pubkey.clone()));
            }
        }

        if self.graph.static_mode {
            let table = self
                .next_hop_table
                .as_ref()
                .ok_or(ConfigError::StaticTableMissing)?;
            validate_next_hop_table(table, &self.peers)?;
        }
        Ok(())
    }

    /// A ready-to-edit example configuration with fresh keys.
    pub fn example() -> Self {
        use crate::crypto::Keypair;
        Self {
            node_name: "supernode".into(),
            priv_key_v4: Keypair::generate().private_base64(),
            priv_key_v6: Keypair::generate().private_base64(),
            passwords: Passwords {
                show_state: "passwd_showstate".into(),
                add_peer: "passwd_addpeer".into(),
                del_peer: "passwd_delpeer".into(),
            },
            next_hop_table: Some(BTreeMap::from([
                (1, BTreeMap::from([(2, 2)])),
                (2, BTreeMap::from([(1, 1)])),
            ])),
            peers: vec![
                PeerConfig {
                    node_id: 1,
                    name: "node_01".into(),
                    pubkey: Keypair::generate().public.to_base64(),
                    psk: None,
                    additional_cost: 10.0,
                },
                PeerConfig {
                    node_id: 2,
                    name: "node_02".into(),
                    pubkey: Keypair::generate().public.to_base64(),
                    psk: None,
                    additional_cost: 10.0,
                },
            ],
            ..Self::default()
        }
    }
}

impl PeerConfig {
    /// Decode and check both keys without keeping the decoded values.
    pub fn validate_keys(&self) -> Result<(), ConfigError> {
        PublicKey::from_base64(&self.pubkey).map_err(|source| ConfigError::BadPeerKey {
            name: self.name.clone(),
            source,
        })?;
        if let Some(psk) = &self.psk {
            PresharedKey::from_base64(psk).map_err(|source| ConfigError::BadPeerPsk {
                name: self.name.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// A static table must route every ordered pair of distinct peers through a
/// roster member. Rejection names the first offending entry.
pub fn validate_next_hop_table(
    table: &NextHopTable,
    peers: &[PeerConfig],
) -> Result<(), ConfigError> {
    let members: HashSet<Vertex> = peers.iter().map(|p| p.node_id).collect();
    for src in peers {
        for dst in peers {
            if src.node_id == dst.node_id {
                continue;
            }
            let hop = table
                .get(&src.node_id)
                .and_then(|row| row.get(&dst.node_id))
                .ok_or(ConfigError::StaticTableIncomplete {
                    src: src.node_id,
                    dst: dst.node_id,
                })?;
            if !members.contains(hop) {
                return Err(ConfigError::StaticTableForeignHop {
                    src: src.node_id,
                    dst: dst.node_id,
                    hop: *hop,
                });
            }
        }
    }
    Ok(())
}

// ── TOML key mapping ─────────────────────────────────────────────────────────

/// TOML table keys are strings; the next-hop table is keyed by vertex IDs.
/// This maps `[next_hop_table.1] 2 = 2` to `table[1][2] = 2` and back.
mod nh_table_keys {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    type StringTable = BTreeMap<String, BTreeMap<String, Vertex>>;

    pub fn serialize<S: Serializer>(
        table: &Option<NextHopTable>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mapped: Option<StringTable> = table.as_ref().map(|t| {
            t.iter()
                .map(|(src, row)| {
                    let row = row.iter().map(|(d, h)| (d.to_string(), *h)).collect();
                    (src.to_string(), row)
                })
                .collect()
        });
        mapped.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NextHopTable>, D::Error> {
        let raw: Option<StringTable> = Option::deserialize(deserializer)?;
        raw.map(|t| {
            t.into_iter()
                .map(|(src, row)| {
                    let src = parse_vertex::<D>(&src)?;
                    let row = row
                        .into_iter()
                        .map(|(dst, hop)| Ok((parse_vertex::<D>(&dst)?, hop)))
                        .collect::<Result<_, D::Error>>()?;
                    Ok((src, row))
                })
                .collect()
        })
        .transpose()
    }

    fn parse_vertex<'de, D: Deserializer<'de>>(key: &str) -> Result<Vertex, D::Error> {
        key.parse()
            .map_err(|_| D::Error::custom(ConfigError::BadTableKey(key.into())))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
