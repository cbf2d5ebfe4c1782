//! Connection registry for live agent channels

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use tunnlr_proto::{CodecError, TunnelCodec, TunnelMessage};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A frame queued for an agent's duplex channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { reason: Option<String> },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Cloneable handle to one agent's duplex channel.
///
/// The transport side owns the matching receiver and writes whatever is queued here to the
/// socket. Each handle carries a unique connection id so a stale session can be told apart from
/// the one that replaced it.
#[derive(Clone, Debug)]
pub struct TunnelChannel {
    connection_id: u64,
    tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl TunnelChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let channel = Self {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (channel, rx)
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Mark the channel closed; later sends report [`ChannelError::Closed`]
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }

        self.tx.send(Outbound::Text(text)).await.map_err(|_| {
            self.mark_closed();
            ChannelError::Closed
        })
    }

    pub async fn send_message(&self, message: &TunnelMessage) -> Result<(), ChannelError> {
        let text = TunnelCodec::encode(message)?;
        self.send_text(text).await
    }

    /// Queue a close frame and mark the channel closed
    pub async fn close(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Receiver may already be gone
        let _ = self.tx.send(Outbound::Close { reason }).await;
    }
}

/// Result of a registry send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Absent,
    Closed,
}

/// A channel that could not be reached during a broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastFailure {
    pub tunnel_id: String,
    pub outcome: SendOutcome,
}

/// Maps tunnel id -> live channel.
///
/// Adding a channel for an id that is already registered replaces the previous handle. The
/// replaced handle is returned to the caller and is not closed here.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    channels: Arc<DashMap<String, TunnelChannel>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tunnel_id: &str, channel: TunnelChannel) -> Option<TunnelChannel> {
        debug!(
            "Registering channel {} for tunnel {}",
            channel.connection_id(),
            tunnel_id
        );
        self.channels.insert(tunnel_id.to_string(), channel)
    }

    pub fn get(&self, tunnel_id: &str) -> Option<TunnelChannel> {
        self.channels.get(tunnel_id).map(|entry| entry.value().clone())
    }

    /// Remove the entry for a tunnel; a no-op if absent
    pub fn remove(&self, tunnel_id: &str) -> Option<TunnelChannel> {
        self.channels.remove(tunnel_id).map(|(_, channel)| channel)
    }

    /// Remove the entry only if it is still the given connection
    pub fn remove_if_current(&self, tunnel_id: &str, connection_id: u64) -> bool {
        let removed = self
            .channels
            .remove_if(tunnel_id, |_, channel| {
                channel.connection_id() == connection_id
            })
            .is_some();

        if !removed {
            trace!(
                "Channel {} for tunnel {} already replaced or removed",
                connection_id,
                tunnel_id
            );
        }
        removed
    }

    pub async fn send(&self, tunnel_id: &str, payload: String) -> SendOutcome {
        // Clone the handle so no map guard is held across the await
        let Some(channel) = self.get(tunnel_id) else {
            return SendOutcome::Absent;
        };

        if !channel.is_open() {
            return SendOutcome::Closed;
        }

        match channel.send_text(payload).await {
            Ok(()) => SendOutcome::Delivered,
            Err(_) => {
                warn!("Channel for tunnel {} closed during send", tunnel_id);
                SendOutcome::Closed
            }
        }
    }

    /// Send to every open channel. Failures are collected, never short-circuited.
    pub async fn broadcast(&self, payload: &str) -> Vec<BroadcastFailure> {
        let snapshot: Vec<(String, TunnelChannel)> = self
            .channels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let sends = snapshot.into_iter().map(|(tunnel_id, channel)| async move {
            let outcome = if !channel.is_open() {
                SendOutcome::Closed
            } else if channel.send_text(payload.to_string()).await.is_ok() {
                SendOutcome::Delivered
            } else {
                SendOutcome::Closed
            };
            (tunnel_id, outcome)
        });

        join_all(sends)
            .await
            .into_iter()
            .filter(|(_, outcome)| *outcome != SendOutcome::Delivered)
            .map(|(tunnel_id, outcome)| BroadcastFailure { tunnel_id, outcome })
            .collect()
    }

    pub fn contains(&self, tunnel_id: &str) -> bool {
        self.channels.contains_key(tunnel_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
