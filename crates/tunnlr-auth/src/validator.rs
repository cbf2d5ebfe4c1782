//! Authentication validator trait
//!
//! Credential issuance lives outside the relay. The relay consumes an opaque bearer token and
//! needs back the identity of the user that owns it.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Identity established from a validated credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthIdentity {
    /// Owning user; at most one active tunnel exists per user
    pub user_id: String,

    /// Allowed protocol labels (empty = all allowed)
    pub allowed_protocols: Vec<String>,

    /// Extra claims worth logging
    pub metadata: HashMap<String, String>,
}

impl AuthIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            allowed_protocols: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.allowed_protocols = protocols;
        self
    }

    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Check if a protocol is allowed
    pub fn is_protocol_allowed(&self, protocol: &str) -> bool {
        self.allowed_protocols.is_empty()
            || self
                .allowed_protocols
                .iter()
                .any(|p| p.eq_ignore_ascii_case(protocol))
    }
}

/// Authentication errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Missing token")]
    MissingToken,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// Trait for credential validation strategies
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Validate a bearer token and return the identity that owns it
    async fn validate(&self, token: &str) -> Result<AuthIdentity, AuthError>;
}
