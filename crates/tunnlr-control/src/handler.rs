//! Agent session handling for the duplex connect endpoint

use crate::connection::TunnelChannel;
use crate::lifecycle::TunnelManager;
use crate::pending_requests::{Delivery, PendingRequests};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tunnlr_auth::AuthValidator;
use tunnlr_proto::{TunnelCodec, TunnelMessage};

/// Query parameters of a connect request, as received
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    pub token: Option<String>,
    pub port: Option<String>,
    pub protocol: Option<String>,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Refused before a tunnel was attached; the agent was sent an `ERROR`
    Rejected { reason: String },
    /// The agent was attached to a tunnel and has since gone away
    Closed { tunnel_id: String },
}

/// Handles agent sessions
pub struct TunnelHandler {
    auth: Arc<dyn AuthValidator>,
    manager: Arc<TunnelManager>,
    pending: PendingRequests,
}

impl TunnelHandler {
    pub fn new(
        auth: Arc<dyn AuthValidator>,
        manager: Arc<TunnelManager>,
        pending: PendingRequests,
    ) -> Self {
        Self {
            auth,
            manager,
            pending,
        }
    }

    /// Drive one agent session until the inbound stream ends.
    ///
    /// `channel` carries frames to the agent; `inbound` yields text frames from it.
    pub async fn handle_session<S, E>(
        &self,
        params: SessionParams,
        channel: TunnelChannel,
        mut inbound: S,
    ) -> SessionOutcome
    where
        S: Stream<Item = Result<String, E>> + Unpin,
        E: Display,
    {
        let token = params.token.unwrap_or_default();
        let identity = match self.auth.validate(&token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Agent authentication failed: {}", e);
                return reject(&channel, format!("Authentication failed: {}", e)).await;
            }
        };
        debug!(
            "Agent authenticated as {} ({})",
            identity.user_id,
            identity
                .metadata
                .get("name")
                .map(String::as_str)
                .unwrap_or("no display name")
        );

        let local_port = match params.port.as_deref().map(str::parse::<u16>) {
            Some(Ok(port)) if port != 0 => port,
            _ => {
                warn!(
                    "User {} requested an invalid port: {:?}",
                    identity.user_id, params.port
                );
                return reject(&channel, "Invalid or missing port".to_string()).await;
            }
        };

        let protocol = params
            .protocol
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "http".to_string())
            .to_ascii_lowercase();

        if !identity.is_protocol_allowed(&protocol) {
            warn!(
                "User {} is not allowed to open {} tunnels",
                identity.user_id, protocol
            );
            return reject(&channel, format!("Protocol {} not allowed", protocol)).await;
        }

        let tunnel = match self
            .manager
            .connect(&identity.user_id, local_port, &protocol, channel.clone())
            .await
        {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!("Failed to attach tunnel for user {}: {}", identity.user_id, e);
                return reject(&channel, "Failed to create tunnel".to_string()).await;
            }
        };

        let tunnel_id = tunnel.id.clone();

        if let Err(e) = channel
            .send_message(&TunnelMessage::TunnelEstablished(tunnel.descriptor()))
            .await
        {
            warn!("Failed to send descriptor for tunnel {}: {}", tunnel_id, e);
            self.finish(&tunnel_id, &channel).await;
            return SessionOutcome::Closed { tunnel_id };
        }

        info!(
            "Tunnel {} connected: {} -> localhost:{}",
            tunnel_id, tunnel.public_url, local_port
        );

        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(text) => self.handle_frame(&tunnel_id, &text),
                Err(e) => {
                    warn!("Transport error on tunnel {}: {}", tunnel_id, e);
                    break;
                }
            }
        }

        self.finish(&tunnel_id, &channel).await;
        SessionOutcome::Closed { tunnel_id }
    }

    fn handle_frame(&self, tunnel_id: &str, text: &str) {
        match TunnelCodec::decode(text) {
            Ok(TunnelMessage::Response(response)) => {
                let request_id = response.request_id.clone();
                if self.pending.deliver(response) == Delivery::Unknown {
                    debug!(
                        "Tunnel {} answered request {} which is no longer pending",
                        tunnel_id, request_id
                    );
                }
            }
            Ok(TunnelMessage::Error { reason }) => {
                warn!(
                    "Agent for tunnel {} reported an error: {}",
                    tunnel_id,
                    reason.as_deref().unwrap_or("(no reason)")
                );
            }
            Ok(TunnelMessage::Unknown) => {
                debug!("Ignoring unrecognized message on tunnel {}", tunnel_id);
            }
            Ok(other) => {
                warn!(
                    "Unexpected {} message from agent on tunnel {}",
                    other.kind(),
                    tunnel_id
                );
            }
            Err(e) => {
                warn!("Malformed message on tunnel {}: {}", tunnel_id, e);
            }
        }
    }

    async fn finish(&self, tunnel_id: &str, channel: &TunnelChannel) {
        channel.mark_closed();
        match self
            .manager
            .disconnect(tunnel_id, channel.connection_id())
            .await
        {
            Ok(true) => info!("Tunnel {} disconnected", tunnel_id),
            Ok(false) => debug!("Superseded session for tunnel {} ended", tunnel_id),
            Err(e) => error!("Failed to mark tunnel {} inactive: {}", tunnel_id, e),
        }
    }
}

async fn reject(channel: &TunnelChannel, reason: String) -> SessionOutcome {
    if let Err(e) = channel.send_message(&TunnelMessage::error(reason.clone())).await {
        debug!("Could not deliver rejection to agent: {}", e);
    }
    channel.close(Some(reason.clone())).await;
    SessionOutcome::Rejected { reason }
}
