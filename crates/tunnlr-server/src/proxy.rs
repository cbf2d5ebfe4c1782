//! Proxy middleware: hands tunnel-addressed requests to the relay engine
//!
//! Runs in front of the router. Requests that do not resolve to a tunnel fall through to the
//! management routes untouched.

use crate::RelayState;
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use tunnlr_control::{ProxyError, ProxyRequest, ProxyResponse};
use tunnlr_proto::{collect_headers, is_hop_by_hop};

pub async fn tunnel_proxy(
    State(state): State<Arc<RelayState>>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string));

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let Some(resolution) = state.resolver.resolve(host.as_deref(), &path_and_query) else {
        return next.run(request).await;
    };

    let client_ip = client_ip(&request);
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, state.config.body_limit).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("Rejecting request to {}: {}", resolution.key(), e);
            return (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large").into_response();
        }
    };

    let headers = collect_headers(
        parts
            .headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str(), value.to_string()))
            }),
    );

    let proxy_request = ProxyRequest {
        method: parts.method.to_string(),
        headers,
        body,
        client_ip,
    };

    match state.engine.forward(resolution, proxy_request).await {
        Ok(reply) => into_response(reply),
        Err(e) => error_response(&e),
    }
}

fn client_ip(request: &Request) -> Option<String> {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip().to_string());
    }

    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

fn into_response(reply: ProxyResponse) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in reply.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!("Dropping unrepresentable response header {}", name),
        }
    }

    response
}

/// Plain-text reply for a proxy failure; internal causes are logged by the engine, never echoed
fn error_response(error: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error.public_message()).into_response()
}
