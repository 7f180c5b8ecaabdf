//! HTTP pull API.
//!
//! The UDP pushes only carry hashes; edges pull the artifacts themselves
//! from here. The `/edge` endpoints are hash-addressed so an edge always
//! receives exactly the artifact a push named. The `/manage` endpoints are
//! guarded by the per-operation passwords from the configuration.

pub mod handlers;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState, prefix: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/edge/nhtable", get(handlers::handle_nh_table))
        .route("/edge/peerinfo", get(handlers::handle_peer_info))
        .route("/edge/superparams", get(handlers::handle_super_params))
        .route("/manage/state", get(handlers::handle_state))
        .route("/manage/peer", post(handlers::handle_peer_add))
        .route("/manage/peer/{id}", delete(handlers::handle_peer_del))
        .with_state(state);

    Router::new().nest(prefix, api_routes).layer(cors)
}

pub async fn serve(
    state: ApiState,
    listener: tokio::net::TcpListener,
    prefix: &str,
) -> anyhow::Result<()> {
    let app = router(state, prefix);
    tracing::info!(addr = %listener.local_addr()?, prefix, "API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
