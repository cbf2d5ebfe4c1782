//! Routing and proxy engine
//!
//! Per inbound request: resolve tunnel -> validate status -> check channel -> forward envelope
//! -> await the correlated response -> build the reply. Expected negative outcomes (not found,
//! inactive, offline, timeout) are distinct [`ProxyError`] kinds; only true faults are
//! [`ProxyError::Internal`].

use crate::connection::{ConnectionRegistry, SendOutcome};
use crate::pending_requests::{AwaitError, PendingRequests};
use crate::DEFAULT_REQUEST_TIMEOUT;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tunnlr_proto::{
    is_hop_by_hop, HeaderMap, RequestEnvelope, ResponseEnvelope, TunnelCodec, TunnelMessage,
};
use tunnlr_relay_db::{TrafficLog, TrafficRecord, Tunnel, TunnelStore};
use tunnlr_router::Resolution;

/// How the agent's response is turned into the relay's reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Relay the agent's status, headers and body
    #[default]
    Passthrough,
    /// Legacy behavior: always 200 with the raw body and no headers
    LegacyOk,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub request_timeout: Duration,
    pub response_mode: ResponseMode,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            response_mode: ResponseMode::Passthrough,
        }
    }
}

/// An inbound request, already buffered
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub headers: HeaderMap,
    pub body: String,
    pub client_ip: Option<String>,
}

/// The reply to write back to the public caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Tunnel not found")]
    TunnelNotFound,

    #[error("Tunnel is inactive")]
    TunnelInactive,

    #[error("Local path not found")]
    LocalPathNotFound,

    #[error("Tunnel offline")]
    TunnelOffline,

    #[error("Gateway timeout")]
    GatewayTimeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::TunnelNotFound
            | ProxyError::TunnelInactive
            | ProxyError::LocalPathNotFound => 404,
            ProxyError::TunnelOffline => 503,
            ProxyError::GatewayTimeout => 504,
            ProxyError::Internal(_) => 500,
        }
    }

    /// Body shown to the public caller; internal causes are never echoed
    pub fn public_message(&self) -> &'static str {
        match self {
            ProxyError::TunnelNotFound => "Tunnel not found",
            ProxyError::TunnelInactive => "Tunnel is inactive",
            ProxyError::LocalPathNotFound => "Local path not found",
            ProxyError::TunnelOffline => "Tunnel offline",
            ProxyError::GatewayTimeout => "Gateway timeout",
            ProxyError::Internal(_) => "Internal server error",
        }
    }
}

/// Drives the request -> forward -> await -> reply cycle
pub struct ProxyEngine {
    store: Arc<dyn TunnelStore>,
    traffic: Arc<dyn TrafficLog>,
    registry: ConnectionRegistry,
    pending: PendingRequests,
    config: ProxyConfig,
}

impl ProxyEngine {
    pub fn new(
        store: Arc<dyn TunnelStore>,
        traffic: Arc<dyn TrafficLog>,
        registry: ConnectionRegistry,
        pending: PendingRequests,
        config: ProxyConfig,
    ) -> Self {
        Self {
            store,
            traffic,
            registry,
            pending,
            config,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub async fn forward(
        &self,
        resolution: Resolution,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let (tunnel, local_path) = self.resolve_tunnel(resolution).await?;

        if !tunnel.is_active() {
            debug!("Tunnel {} is {}, refusing request", tunnel.id, tunnel.status);
            return Err(ProxyError::TunnelInactive);
        }

        match self.registry.get(&tunnel.id) {
            Some(channel) if channel.is_open() => {}
            _ => {
                debug!("Tunnel {} has no open channel", tunnel.id);
                return Err(ProxyError::TunnelOffline);
            }
        }

        let started_at = Utc::now();
        let request_id = uuid::Uuid::new_v4().to_string();

        // Install the waiter before sending so the reply cannot outrun it
        let waiter = self
            .pending
            .register(request_id.clone())
            .map_err(|e| internal("register pending request", e))?;

        let bytes_received = request.body.len() as u64;
        let envelope = TunnelMessage::Request(RequestEnvelope {
            request_id: request_id.clone(),
            method: request.method.clone(),
            path: local_path.clone(),
            headers: request.headers,
            body: request.body,
        });
        let payload =
            TunnelCodec::encode(&envelope).map_err(|e| internal("encode request envelope", e))?;

        info!(
            "Forwarding {} {} to tunnel {} (request {})",
            request.method, local_path, tunnel.id, request_id
        );

        match self.registry.send(&tunnel.id, payload).await {
            SendOutcome::Delivered => {}
            SendOutcome::Absent | SendOutcome::Closed => {
                debug!("Tunnel {} went offline before forwarding", tunnel.id);
                return Err(ProxyError::TunnelOffline);
            }
        }

        let response = match waiter.wait(self.config.request_timeout).await {
            Ok(response) => response,
            Err(AwaitError::TimedOut) => {
                warn!(
                    "Request {} to tunnel {} timed out after {:?}",
                    request_id, tunnel.id, self.config.request_timeout
                );
                return Err(ProxyError::GatewayTimeout);
            }
            Err(e) => return Err(internal("await agent response", e)),
        };

        let reply = self.build_reply(response)?;

        self.record_traffic(TrafficRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tunnel_id: tunnel.id.clone(),
            request_id,
            method: request.method,
            path: local_path,
            status_code: reply.status,
            client_ip: request.client_ip,
            bytes_received,
            bytes_sent: reply.body.len() as u64,
            started_at,
            completed_at: Utc::now(),
        })
        .await;

        Ok(reply)
    }

    async fn resolve_tunnel(&self, resolution: Resolution) -> Result<(Tunnel, String), ProxyError> {
        let (found, local_path) = match resolution {
            Resolution::TunnelPath {
                tunnel_id,
                local_path,
            } => {
                let local_path = local_path.ok_or(ProxyError::LocalPathNotFound)?;
                let found = self
                    .store
                    .find_by_id(&tunnel_id)
                    .await
                    .map_err(|e| internal("look up tunnel by id", e))?;
                (found, local_path)
            }
            Resolution::Subdomain {
                subdomain,
                local_path,
            } => {
                let found = self
                    .store
                    .find_by_subdomain(&subdomain)
                    .await
                    .map_err(|e| internal("look up tunnel by subdomain", e))?;
                (found, local_path)
            }
        };

        found
            .map(|tunnel| (tunnel, local_path))
            .ok_or(ProxyError::TunnelNotFound)
    }

    fn build_reply(&self, response: ResponseEnvelope) -> Result<ProxyResponse, ProxyError> {
        match self.config.response_mode {
            ResponseMode::LegacyOk => Ok(ProxyResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: response.body,
            }),
            ResponseMode::Passthrough => {
                if !(100..=599).contains(&response.status_code) {
                    return Err(internal(
                        "relay agent response",
                        format!("invalid status code {}", response.status_code),
                    ));
                }

                let headers = response
                    .headers
                    .into_iter()
                    .filter(|(name, _)| !is_hop_by_hop(name))
                    .collect();

                Ok(ProxyResponse {
                    status: response.status_code,
                    headers,
                    body: response.body,
                })
            }
        }
    }

    async fn record_traffic(&self, record: TrafficRecord) {
        if let Err(e) = self.traffic.record(&record).await {
            warn!(
                "Failed to record traffic for tunnel {}: {}",
                record.tunnel_id, e
            );
        }
    }
}

fn internal(context: &str, cause: impl std::fmt::Display) -> ProxyError {
    error!("Proxy failure ({}): {}", context, cause);
    ProxyError::Internal(format!("{}: {}", context, cause))
}
