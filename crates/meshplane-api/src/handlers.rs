//! Edge pull and management handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use meshplane_core::config::PeerConfig;
use meshplane_core::{NextHopTable, Vertex};
use meshplane_services::{RosterPeer, SuperParams, Supernode};

#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<Supernode>,
}

type ApiError = (StatusCode, String);

fn not_found(what: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, what.into())
}

// ── Edge pulls ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PullQuery {
    /// Hash from the push that prompted this pull. When present it must
    /// name the current artifact; a stale hash means a newer push is on the
    /// way and the edge should wait for it.
    pub hash: Option<String>,
}

#[derive(Serialize)]
pub struct NhTableResponse {
    pub hash: String,
    pub table: NextHopTable,
}

pub async fn handle_nh_table(
    State(state): State<ApiState>,
    Query(query): Query<PullQuery>,
) -> Result<Json<NhTableResponse>, ApiError> {
    let hash = state.node.nh_hash();
    if let Some(wanted) = query.hash {
        if wanted != hash {
            return Err(not_found("hash does not name the current next-hop table"));
        }
    }
    Ok(Json(NhTableResponse {
        hash,
        table: state.node.nh_table(),
    }))
}

#[derive(Serialize)]
pub struct PeerInfoResponse {
    pub hash: String,
    pub peers: Vec<RosterPeer>,
}

pub async fn handle_peer_info(
    State(state): State<ApiState>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PeerInfoResponse>, ApiError> {
    let hash = state.node.peer_hash();
    if let Some(wanted) = query.hash {
        if wanted != hash {
            return Err(not_found("hash does not name the current roster"));
        }
    }
    let peers = state.node.registry().roster();
    Ok(Json(PeerInfoResponse { hash, peers }))
}

#[derive(Deserialize)]
pub struct SuperParamsQuery {
    pub node_id: Vertex,
}

#[derive(Serialize)]
pub struct SuperParamsResponse {
    pub hash: String,
    pub params: SuperParams,
}

pub async fn handle_super_params(
    State(state): State<ApiState>,
    Query(query): Query<SuperParamsQuery>,
) -> Result<Json<SuperParamsResponse>, ApiError> {
    let registry = state.node.registry();
    let peer = registry
        .peer(query.node_id)
        .ok_or_else(|| not_found("unknown node id"))?;
    let record = registry
        .record_for_id(query.node_id)
        .ok_or_else(|| not_found("unknown node id"))?;
    Ok(Json(SuperParamsResponse {
        hash: record.params_hash(),
        params: state.node.super_params_for(peer.additional_cost),
    }))
}

// ── Management ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ManageQuery {
    #[serde(default)]
    pub password: String,
}

fn authorize(given: &str, wanted: &str) -> Result<(), ApiError> {
    if wanted.is_empty() || given != wanted {
        return Err((StatusCode::UNAUTHORIZED, "wrong password".into()));
    }
    Ok(())
}

#[derive(Serialize)]
pub struct StateResponse {
    pub node_name: String,
    pub nh_table_hash: String,
    pub peer_info_hash: String,
    pub peers: Vec<PeerStateInfo>,
}

#[derive(Serialize)]
pub struct PeerStateInfo {
    pub node_id: Vertex,
    pub name: String,
    pub pubkey: String,
    pub alive: bool,
    pub last_seen_ms: u64,
    pub http_post_count: u64,
    pub nh_hash_acked: String,
    pub peer_hash_acked: String,
    pub params_hash: String,
    pub params_hash_acked: String,
}

pub async fn handle_state(
    State(state): State<ApiState>,
    Query(query): Query<ManageQuery>,
) -> Result<Json<StateResponse>, ApiError> {
    authorize(&query.password, &state.node.cfg.passwords.show_state)?;

    let registry = state.node.registry();
    let mut peers: Vec<PeerStateInfo> = registry
        .peers()
        .filter_map(|peer| {
            let record = registry.record(&peer.pubkey)?;
            Some(PeerStateInfo {
                node_id: peer.node_id,
                name: peer.name.clone(),
                pubkey: peer.pubkey.clone(),
                alive: state.node.is_alive(record),
                last_seen_ms: record.last_seen_millis(),
                http_post_count: record.http_post_count(),
                nh_hash_acked: record.nh_hash_acked(),
                peer_hash_acked: record.peer_hash_acked(),
                params_hash: record.params_hash(),
                params_hash_acked: record.params_hash_acked(),
            })
        })
        .collect();
    peers.sort_by_key(|p| p.node_id);

    Ok(Json(StateResponse {
        node_name: state.node.cfg.node_name.clone(),
        nh_table_hash: state.node.nh_hash(),
        peer_info_hash: state.node.peer_hash(),
        peers,
    }))
}

#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

pub async fn handle_peer_add(
    State(state): State<ApiState>,
    Query(query): Query<ManageQuery>,
    Json(peer): Json<PeerConfig>,
) -> Result<Json<OkResponse>, ApiError> {
    authorize(&query.password, &state.node.cfg.passwords.add_peer)?;

    let node_id = peer.node_id;
    state
        .node
        .admit_peer(peer)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    tracing::info!(node_id, "peer admitted via API");
    Ok(Json(OkResponse { ok: true }))
}

pub async fn handle_peer_del(
    State(state): State<ApiState>,
    Path(node_id): Path<Vertex>,
    Query(query): Query<ManageQuery>,
) -> Result<Json<OkResponse>, ApiError> {
    authorize(&query.password, &state.node.cfg.passwords.del_peer)?;

    if !state.node.remove_peer(node_id) {
        return Err(not_found("unknown node id"));
    }
    tracing::info!(node_id, "peer removed via API");
    Ok(Json(OkResponse { ok: true }))
}
