//! Agent side of the duplex channel
//!
//! [`TunnelAgent::connect`] performs the handshake and reports its result as a value:
//! either an established [`TunnelSession`] or the relay's rejection. The session's forwarding
//! loop then reports asynchronous happenings through an [`AgentEvent`] channel.

use crate::config::AgentConfig;
use crate::forwarder::LocalForwarder;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tunnlr_proto::{CodecError, RequestEnvelope, TunnelCodec, TunnelDescriptor, TunnelMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WRITER_CAPACITY: usize = 64;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Relay closed the connection before the tunnel was established")]
    ClosedBeforeEstablished,

    #[error("Unexpected {0} message during handshake")]
    UnexpectedMessage(&'static str),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Relay rejected the credential: {0}")]
    Unauthorized(String),

    #[error("Relay API error: {0}")]
    Api(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AgentError::Transport(e.to_string())
    }
}

/// Result of a connect attempt
#[derive(Debug)]
pub enum ConnectOutcome {
    Established(TunnelSession),
    /// The relay refused the agent (bad token, bad port, protocol not allowed, ...)
    Rejected { reason: String },
}

/// Out-of-band notices from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The relay reported a failure on an established tunnel; the session ends
    Error { reason: Option<String> },
    /// The tunnel was closed on the relay side (e.g. deactivated by its owner)
    TunnelClosed { reason: Option<String> },
}

/// Things a running session reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    RequestForwarded {
        request_id: String,
        method: String,
        path: String,
        status_code: u16,
        elapsed: Duration,
    },
    Control(ControlEvent),
    Disconnected { reason: Option<String> },
}

/// Connects agents to a relay
pub struct TunnelAgent {
    config: AgentConfig,
}

impl TunnelAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Open the duplex channel and wait for the relay's verdict
    pub async fn connect(&self) -> Result<ConnectOutcome, AgentError> {
        let url = self.config.connect_url()?;
        let forwarder = LocalForwarder::from_config(&self.config)?;

        info!(
            "Connecting to relay at {}://{}",
            url.scheme(),
            url.host_str().unwrap_or_default()
        );
        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

        while let Some(frame) = socket.next().await {
            let message = match frame? {
                Message::Text(text) => TunnelCodec::decode(&text)?,
                Message::Binary(bytes) => match TunnelCodec::decode_bytes(&bytes) {
                    Ok(message) => message,
                    Err(CodecError::InvalidUtf8) => continue,
                    Err(e) => return Err(e.into()),
                },
                Message::Close(frame) => {
                    debug!("Relay closed during handshake: {:?}", frame);
                    break;
                }
                _ => continue,
            };

            match message {
                TunnelMessage::TunnelEstablished(descriptor) => {
                    info!("Tunnel established: {}", descriptor.public_url);
                    return Ok(ConnectOutcome::Established(TunnelSession {
                        descriptor,
                        socket,
                        forwarder: Arc::new(forwarder),
                    }));
                }
                TunnelMessage::Error { reason } => {
                    let reason = reason.unwrap_or_else(|| "Connection rejected".to_string());
                    warn!("Relay rejected the agent: {}", reason);
                    let _ = socket.close(None).await;
                    return Ok(ConnectOutcome::Rejected { reason });
                }
                TunnelMessage::Unknown => {
                    debug!("Ignoring unrecognized message during handshake");
                }
                other => return Err(AgentError::UnexpectedMessage(other.kind())),
            }
        }

        Err(AgentError::ClosedBeforeEstablished)
    }
}

/// An established tunnel, ready to forward traffic
pub struct TunnelSession {
    descriptor: TunnelDescriptor,
    socket: Socket,
    forwarder: Arc<LocalForwarder>,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

enum Flow {
    Continue,
    Stop(Option<String>),
}

impl TunnelSession {
    pub fn descriptor(&self) -> &TunnelDescriptor {
        &self.descriptor
    }

    /// Forward requests until the relay goes away, reports an error or closes the tunnel.
    ///
    /// Each request is replayed on its own task, so a slow local call never holds up the
    /// others. Ends with an [`AgentEvent::Disconnected`].
    pub async fn run(self, events: mpsc::Sender<AgentEvent>) -> Result<(), AgentError> {
        let tunnel_id = self.descriptor.tunnel_id.clone();
        let (sink, mut stream) = self.socket.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(WRITER_CAPACITY);
        let writer = tokio::spawn(write_frames(sink, out_rx));
        let mut in_flight = JoinSet::new();

        let reason = loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Forwarding task failed: {}", e);
                    }
                    continue;
                }
            };

            let decoded = match frame {
                Some(Ok(Message::Text(text))) => TunnelCodec::decode(&text),
                Some(Ok(Message::Binary(bytes))) => TunnelCodec::decode_bytes(&bytes),
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Relay connection error: {}", e);
                    break Some(e.to_string());
                }
                None => break None,
            };

            let message = match decoded {
                Ok(message) => message,
                Err(e) => {
                    warn!("Malformed message from relay: {}", e);
                    continue;
                }
            };

            match message {
                TunnelMessage::Request(request) => {
                    in_flight.spawn(handle_request(
                        request,
                        self.forwarder.clone(),
                        out_tx.clone(),
                        events.clone(),
                    ));
                }
                other => match handle_control(other, &events).await {
                    Flow::Continue => {}
                    Flow::Stop(reason) => {
                        let _ = out_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "Tunnel closed".into(),
                            })))
                            .await;
                        break reason;
                    }
                },
            }
        };

        info!("Tunnel {} disconnected", tunnel_id);

        // Nobody is left to read replies from requests still in progress
        in_flight.shutdown().await;
        drop(out_tx);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            debug!("Writer did not finish in time");
        }

        let _ = events.send(AgentEvent::Disconnected { reason }).await;
        Ok(())
    }
}

async fn handle_control(message: TunnelMessage, events: &mpsc::Sender<AgentEvent>) -> Flow {
    match message {
        TunnelMessage::Error { reason } => {
            warn!(
                "Relay reported an error: {}",
                reason.as_deref().unwrap_or("(no reason)")
            );
            let _ = events
                .send(AgentEvent::Control(ControlEvent::Error {
                    reason: reason.clone(),
                }))
                .await;
            Flow::Stop(reason)
        }
        TunnelMessage::TunnelClosed { reason } => {
            info!(
                "Relay closed the tunnel: {}",
                reason.as_deref().unwrap_or("(no reason)")
            );
            let _ = events
                .send(AgentEvent::Control(ControlEvent::TunnelClosed {
                    reason: reason.clone(),
                }))
                .await;
            Flow::Stop(reason)
        }
        TunnelMessage::Unknown => {
            debug!("Ignoring unrecognized message from relay");
            Flow::Continue
        }
        other => {
            warn!("Unexpected {} message from relay", other.kind());
            Flow::Continue
        }
    }
}

async fn handle_request(
    request: RequestEnvelope,
    forwarder: Arc<LocalForwarder>,
    out: mpsc::Sender<Message>,
    events: mpsc::Sender<AgentEvent>,
) {
    let started = Instant::now();
    let request_id = request.request_id.clone();
    let method = request.method.clone();
    let path = request.path.clone();

    let response = forwarder.forward(request).await;
    let status_code = response.status_code;

    let payload = match TunnelCodec::encode(&TunnelMessage::Response(response)) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to encode response to {}: {}", request_id, e);
            return;
        }
    };

    if out.send(Message::Text(payload)).await.is_err() {
        debug!("Connection gone before response to {} was sent", request_id);
        return;
    }

    debug!("{} {} -> {} ({})", method, path, status_code, request_id);
    let _ = events
        .send(AgentEvent::RequestForwarded {
            request_id,
            method,
            path,
            status_code,
            elapsed: started.elapsed(),
        })
        .await;
}

async fn write_frames(mut sink: SplitSink<Socket, Message>, mut frames: mpsc::Receiver<Message>) {
    while let Some(frame) = frames.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = sink.send(frame).await {
            debug!("Relay socket write failed: {}", e);
            return;
        }
        if closing {
            return;
        }
    }
    let _ = sink.close().await;
}
