//! JSON codec for duplex channel messages

use crate::messages::TunnelMessage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Message is not valid UTF-8")]
    InvalidUtf8,
}

/// Encodes and decodes [`TunnelMessage`] text frames.
///
/// Unknown fields are ignored. A missing required field is always a decode error.
pub struct TunnelCodec;

impl TunnelCodec {
    pub fn encode(message: &TunnelMessage) -> Result<String, CodecError> {
        serde_json::to_string(message).map_err(CodecError::Encode)
    }

    pub fn decode(text: &str) -> Result<TunnelMessage, CodecError> {
        serde_json::from_str(text).map_err(CodecError::Decode)
    }

    /// Decode a binary frame that carries UTF-8 JSON
    pub fn decode_bytes(bytes: &[u8]) -> Result<TunnelMessage, CodecError> {
        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
        Self::decode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HeaderMap, RequestEnvelope, ResponseEnvelope};
    use crate::tunnel::TunnelDescriptor;

    #[test]
    fn test_response_decodes_from_agent_json() {
        let text = r#"{
            "type": "RESPONSE",
            "request_id": "abc",
            "status_code": 201,
            "headers": {"content-type": "application/json"},
            "body": "{\"ok\":true}"
        }"#;

        match TunnelCodec::decode(text).unwrap() {
            TunnelMessage::Response(resp) => {
                assert_eq!(resp.request_id, "abc");
                assert_eq!(resp.status_code, 201);
                assert_eq!(
                    resp.headers.get("content-type").map(String::as_str),
                    Some("application/json")
                );
                assert_eq!(resp.body, "{\"ok\":true}");
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let text = r#"{"type":"REQUEST","request_id":"1","method":"GET","path":"/","trace":"x","priority":3}"#;
        let msg = TunnelCodec::decode(text).unwrap();
        assert_eq!(
            msg,
            TunnelMessage::Request(RequestEnvelope {
                request_id: "1".to_string(),
                method: "GET".to_string(),
                path: "/".to_string(),
                headers: HeaderMap::new(),
                body: String::new(),
            })
        );
    }

    #[test]
    fn test_missing_required_field_fails() {
        // status_code is required
        let text = r#"{"type":"RESPONSE","request_id":"1","body":"hi"}"#;
        assert!(matches!(
            TunnelCodec::decode(text),
            Err(CodecError::Decode(_))
        ));

        // request_id is required
        let text = r#"{"type":"REQUEST","method":"GET","path":"/"}"#;
        assert!(TunnelCodec::decode(text).is_err());
    }

    #[test]
    fn test_wrongly_typed_field_is_not_coerced() {
        let text = r#"{"type":"RESPONSE","request_id":"1","status_code":"200"}"#;
        assert!(TunnelCodec::decode(text).is_err());
    }

    #[test]
    fn test_unrecognized_type_is_unknown() {
        let msg = TunnelCodec::decode(r#"{"type":"HEARTBEAT","seq":4}"#).unwrap();
        assert_eq!(msg, TunnelMessage::Unknown);
    }

    #[test]
    fn test_missing_type_fails() {
        assert!(TunnelCodec::decode(r#"{"reason":"x"}"#).is_err());
    }

    #[test]
    fn test_control_without_reason() {
        let msg = TunnelCodec::decode(r#"{"type":"TUNNEL_CLOSED"}"#).unwrap();
        assert_eq!(msg, TunnelMessage::TunnelClosed { reason: None });
    }

    #[test]
    fn test_established_descriptor() {
        let msg = TunnelMessage::TunnelEstablished(TunnelDescriptor {
            tunnel_id: "t-1".to_string(),
            public_url: "https://abc12345.tunnlr.dev".to_string(),
            dashboard_url: "https://dashboard.tunnlr.dev/abc12345".to_string(),
        });

        let text = TunnelCodec::encode(&msg).unwrap();
        assert!(text.contains(r#""type":"TUNNEL_ESTABLISHED""#));
        assert_eq!(TunnelCodec::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_decode_bytes_rejects_invalid_utf8() {
        assert!(matches!(
            TunnelCodec::decode_bytes(&[0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        ));

        let resp = TunnelMessage::Response(ResponseEnvelope::text("r", 502, "bad gateway"));
        let text = TunnelCodec::encode(&resp).unwrap();
        assert_eq!(TunnelCodec::decode_bytes(text.as_bytes()).unwrap(), resp);
    }
}
