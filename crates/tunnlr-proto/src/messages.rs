//! Protocol message types

use crate::tunnel::TunnelDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header map carried by envelopes (lower-cased name -> value)
pub type HeaderMap = BTreeMap<String, String>;

/// Main tunnel protocol message enum
///
/// Every message carries an explicit `type` discriminator. Any `type` this build does not know
/// about decodes as [`TunnelMessage::Unknown`] instead of failing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelMessage {
    /// Relay -> agent: replay this request against the local service
    Request(RequestEnvelope),
    /// Agent -> relay: the answer to a previously forwarded request
    Response(ResponseEnvelope),
    /// Either direction: out-of-band failure (e.g. rejected credential)
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Relay -> agent: the tunnel was deactivated by its owner
    TunnelClosed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Relay -> agent: first message of an accepted session
    TunnelEstablished(TunnelDescriptor),
    #[serde(other)]
    Unknown,
}

impl TunnelMessage {
    pub fn error(reason: impl Into<String>) -> Self {
        TunnelMessage::Error {
            reason: Some(reason.into()),
        }
    }

    pub fn tunnel_closed(reason: impl Into<String>) -> Self {
        TunnelMessage::TunnelClosed {
            reason: Some(reason.into()),
        }
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::Request(_) => "REQUEST",
            TunnelMessage::Response(_) => "RESPONSE",
            TunnelMessage::Error { .. } => "ERROR",
            TunnelMessage::TunnelClosed { .. } => "TUNNEL_CLOSED",
            TunnelMessage::TunnelEstablished(_) => "TUNNEL_ESTABLISHED",
            TunnelMessage::Unknown => "UNKNOWN",
        }
    }
}

/// A request forwarded from the relay to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Fresh per inbound HTTP request (not the tunnel id)
    pub request_id: String,
    pub method: String,
    /// Path relative to the agent's local root, including any query string
    pub path: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub body: String,
}

/// The agent's reply to a forwarded request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub body: String,
}

impl ResponseEnvelope {
    /// Plain-text response with no extra headers
    pub fn text(request_id: impl Into<String>, status_code: u16, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        );
        Self {
            request_id: request_id.into(),
            status_code,
            headers,
            body: body.into(),
        }
    }
}

/// Build an envelope header map from (name, value) pairs.
///
/// Names are lower-cased; when a name repeats, the last value wins.
pub fn collect_headers<I, K, V>(pairs: I) -> HeaderMap
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.as_ref().to_ascii_lowercase(), value.into()))
        .collect()
}

/// Headers that describe a single hop and are never relayed
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Whether a header applies to one connection only (`content-length` included, since bodies
/// are re-framed on every hop)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}
