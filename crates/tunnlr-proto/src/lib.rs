//! Tunnlr Protocol Definitions
//!
//! This crate defines the envelopes exchanged between the relay and a client agent over the
//! duplex channel, the JSON codec for them, and the tunnel vocabulary (status, descriptor,
//! test-path convention) shared by both sides.

pub mod codec;
pub mod messages;
pub mod tunnel;

pub use codec::{CodecError, TunnelCodec};
pub use messages::*;
pub use tunnel::{
    split_test_path, strip_test_path, TestPath, TunnelDescriptor, TunnelStatus,
    DEFAULT_API_PREFIX,
};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Path of the duplex connect endpoint on the relay
pub const CONNECT_PATH: &str = "/tunnel";
