//! Agent connect endpoint: bridges a WebSocket to the session handler

use crate::models::ConnectParams;
use crate::RelayState;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use tunnlr_control::{Outbound, SessionOutcome, SessionParams, TunnelChannel};

const NORMAL_CLOSURE: u16 = 1000;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Agent connect endpoint
///
/// Upgrades to a WebSocket. Authentication and parameter checks happen after the upgrade so the
/// agent always receives its rejection as an `ERROR` frame.
#[utoipa::path(
    get,
    path = "/tunnel",
    params(ConnectParams),
    responses(
        (status = 101, description = "Switching to the tunnel protocol")
    ),
    tag = "agents"
)]
pub async fn connect_agent(
    State(state): State<Arc<RelayState>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let port = params.port.clone().unwrap_or_default();
    ws.on_upgrade(move |socket| {
        run_agent_socket(socket, state, params).instrument(info_span!("agent_session", %port))
    })
}

async fn run_agent_socket(socket: WebSocket, state: Arc<RelayState>, params: ConnectParams) {
    let (sink, stream) = socket.split();
    let (channel, outbound_rx) = TunnelChannel::new(state.config.channel_capacity);

    let writer = tokio::spawn(write_frames(sink, outbound_rx, state.config.ping_interval));

    let inbound = stream
        .take_while(|frame| futures::future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| {
            futures::future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!("Dropping non-UTF-8 binary frame from agent");
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });
    let inbound = Box::pin(inbound);

    let session_params = SessionParams {
        token: params.token,
        port: params.port,
        protocol: params.protocol,
    };

    match state
        .handler
        .handle_session(session_params, channel.clone(), inbound)
        .await
    {
        SessionOutcome::Rejected { reason } => info!("Agent rejected: {}", reason),
        SessionOutcome::Closed { tunnel_id } => info!("Agent for tunnel {} went away", tunnel_id),
    }

    // The writer stops once the last sender is gone
    drop(channel);
    let mut writer = writer;
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Agent writer task failed: {}", e),
        Err(_) => {
            debug!("Agent writer still running after session end, aborting");
            writer.abort();
        }
    }
}

/// Drains queued frames into the socket and keeps the connection alive with pings
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    ping_interval: Duration,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            debug!("Agent socket write failed: {}", e);
                            break;
                        }
                    }
                    Some(Outbound::Close { reason }) => {
                        let frame = CloseFrame {
                            code: NORMAL_CLOSURE,
                            reason: reason.unwrap_or_default().into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!("Failed to send close frame: {}", e);
                        }
                        break;
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    debug!("Agent ping failed: {}", e);
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}
