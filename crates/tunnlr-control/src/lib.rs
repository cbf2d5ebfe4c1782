//! Relay engine for tunnel orchestration
//!
//! - [`ConnectionRegistry`]: live duplex channel per tunnel
//! - [`PendingRequests`]: correlation of forwarded requests with agent responses
//! - [`TunnelManager`]: tunnel lifecycle (connect / deactivate / disconnect)
//! - [`ProxyEngine`]: inbound HTTP request -> forward -> await -> reply
//! - [`TunnelHandler`]: drives one agent session over a duplex channel

pub mod connection;
pub mod handler;
pub mod lifecycle;
pub mod pending_requests;
pub mod proxy;

pub use connection::{
    BroadcastFailure, ChannelError, ConnectionRegistry, Outbound, SendOutcome, TunnelChannel,
};
pub use handler::{SessionOutcome, SessionParams, TunnelHandler};
pub use lifecycle::{LifecycleConfig, LifecycleError, TunnelManager};
pub use pending_requests::{AwaitError, Delivery, PendingRequests, PendingResponse};
pub use proxy::{ProxyConfig, ProxyEngine, ProxyError, ProxyRequest, ProxyResponse, ResponseMode};

use std::time::Duration;

/// How long the relay waits for an agent to answer a forwarded request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound queue depth per agent channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
