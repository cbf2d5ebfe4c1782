//! API models for the relay management surface

use serde::{Deserialize, Serialize};
use tunnlr_proto::TunnelStatus;
use utoipa::{IntoParams, ToSchema};

/// Query string of the agent connect endpoint.
///
/// Every field is optional here so that a missing value reaches the session handler and is
/// reported to the agent as an `ERROR` frame rather than as an HTTP 400.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ConnectParams {
    /// Bearer token identifying the agent's owner
    pub token: Option<String>,
    /// Port of the agent's local service
    pub port: Option<String>,
    /// Local protocol (defaults to `http`)
    pub protocol: Option<String>,
}

/// Current state of a tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelStatusResponse {
    pub tunnel_id: String,
    pub status: TunnelStatus,
    /// Public URL (e.g., https://k3x9q2ab.tunnlr.dev)
    pub public_url: String,
    pub dashboard_url: String,
    pub local_port: u16,
    pub protocol: String,
    /// Whether an agent channel is currently attached
    pub connected: bool,
    /// Number of proxied requests recorded for this tunnel
    pub request_count: u64,
    /// Request plus response body bytes recorded for this tunnel
    pub bytes_transferred: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Version information
    pub version: String,
    /// Number of agents currently attached
    pub connected_tunnels: usize,
    /// Number of requests awaiting an agent response
    pub pending_requests: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}
