//! Bearer authentication for the management endpoints
//!
//! Reads `Authorization: Bearer <token>` and validates it with the same [`tunnlr_auth::AuthValidator`] the
//! connect endpoint uses, so a tunnel is managed with the credential that opened it.

use crate::models::ErrorResponse;
use crate::RelayState;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::debug;
use tunnlr_auth::AuthIdentity;

/// The caller behind a management request
#[derive(Debug, Clone)]
pub struct Owner(pub AuthIdentity);

fn unauthorized(error: impl Into<String>, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new(error, code)),
    )
}

impl FromRequestParts<Arc<RelayState>> for Owner {
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<RelayState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| unauthorized("Missing Authorization header", "MISSING_AUTH"))?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            unauthorized(
                "Invalid Authorization header format. Expected 'Bearer <token>'",
                "INVALID_AUTH_FORMAT",
            )
        })?;

        let identity = state.auth.validate(token.trim()).await.map_err(|e| {
            debug!("Rejected management credential: {}", e);
            unauthorized(format!("Invalid or expired token: {}", e), "INVALID_TOKEN")
        })?;

        Ok(Owner(identity))
    }
}
