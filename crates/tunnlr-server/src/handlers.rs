//! Management handlers

use crate::auth::Owner;
use crate::models::{ErrorResponse, HealthResponse, TunnelStatusResponse};
use crate::RelayState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{debug, error, info};
use tunnlr_control::LifecycleError;
use tunnlr_relay_db::Tunnel;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(
            format!("Tunnel not found: {}", id),
            "TUNNEL_NOT_FOUND",
        )),
    )
}

/// Look up a tunnel the caller owns; someone else's tunnel reads as missing
async fn owned_tunnel(state: &RelayState, owner: &Owner, id: &str) -> Result<Tunnel, ApiError> {
    let tunnel = state
        .manager
        .find(id)
        .await
        .map_err(|e| internal_error("look up tunnel", e))?
        .ok_or_else(|| not_found(id))?;

    if tunnel.user_id != owner.0.user_id {
        debug!(
            "User {} asked for tunnel {} owned by someone else",
            owner.0.user_id, id
        );
        return Err(not_found(id));
    }

    Ok(tunnel)
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> ApiError {
    error!("Failed to {}: {}", context, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("Internal server error", "INTERNAL_ERROR")),
    )
}

/// Deactivate a tunnel
///
/// Marks the tunnel `Deactivated` and tells its agent (if connected) that the tunnel was closed.
#[utoipa::path(
    delete,
    path = "/api/tunnels/{id}",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 204, description = "Tunnel deactivated"),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
        (status = 404, description = "Tunnel not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "tunnels"
)]
pub async fn deactivate_tunnel(
    State(state): State<Arc<RelayState>>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    owned_tunnel(&state, &owner, &id).await?;
    info!("Deactivating tunnel {} for {}", id, owner.0.user_id);

    match state.manager.deactivate(&id).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(LifecycleError::NotFound(_)) => Err(not_found(&id)),
        Err(e) => Err(internal_error("deactivate tunnel", e)),
    }
}

/// Deactivate a tunnel (alternate path kept for older agents)
#[utoipa::path(
    delete,
    path = "/api/tunnels/deactivate/{id}",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 204, description = "Tunnel deactivated"),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
        (status = 404, description = "Tunnel not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "tunnels"
)]
pub async fn deactivate_tunnel_legacy(
    state: State<Arc<RelayState>>,
    owner: Owner,
    id: Path<String>,
) -> Result<StatusCode, ApiError> {
    deactivate_tunnel(state, owner, id).await
}

/// Get a tunnel's status and traffic totals
#[utoipa::path(
    get,
    path = "/api/tunnels/{id}/status",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Tunnel status", body = TunnelStatusResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
        (status = 404, description = "Tunnel not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "tunnels"
)]
pub async fn tunnel_status(
    State(state): State<Arc<RelayState>>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<TunnelStatusResponse>, ApiError> {
    debug!("Getting status for tunnel: {}", id);

    let tunnel = owned_tunnel(&state, &owner, &id).await?;

    let summary = state
        .traffic
        .summarize(&tunnel.id)
        .await
        .map_err(|e| internal_error("summarize traffic", e))?;

    let connected = state
        .manager
        .registry()
        .get(&tunnel.id)
        .is_some_and(|channel| channel.is_open());

    Ok(Json(TunnelStatusResponse {
        connected,
        request_count: summary.request_count,
        bytes_transferred: summary.bytes_transferred,
        tunnel_id: tunnel.id,
        status: tunnel.status,
        public_url: tunnel.public_url,
        dashboard_url: tunnel.dashboard_url,
        local_port: tunnel.local_port,
        protocol: tunnel.protocol,
    }))
}

/// Health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_tunnels: state.manager.registry().len(),
        pending_requests: state.pending.count(),
    })
}
