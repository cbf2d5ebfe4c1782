//! TunnlR agent library
//!
//! Holds the agent's end of a tunnel: connects to a relay, replays forwarded requests against
//! a local service and ships the responses back.

pub mod agent;
pub mod api;
pub mod config;
pub mod forwarder;
pub mod token_store;

pub use agent::{AgentError, AgentEvent, ConnectOutcome, ControlEvent, TunnelAgent, TunnelSession};
pub use api::{RelayApiClient, TunnelStatusReport};
pub use config::{AgentConfig, AgentConfigBuilder};
pub use forwarder::LocalForwarder;
pub use token_store::{StoredConfig, TokenStore};

pub use tunnlr_proto::TunnelDescriptor;
