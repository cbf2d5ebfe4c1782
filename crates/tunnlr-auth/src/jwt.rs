//! JWT (JSON Web Token) handling

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::{AuthError, AuthIdentity, AuthValidator};

/// JWT claims accepted by the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Custom: display name of the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Custom: allowed protocols
    #[serde(default)]
    pub protocols: Vec<String>,
}

impl JwtClaims {
    pub fn new(user_id: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: user_id,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
            name: None,
            protocols: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,
}

/// JWT validator (HMAC-SHA256, symmetric secret)
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Validates signature and expiration. Issuer and audience are only checked once
    /// configured through [`with_issuer`](Self::with_issuer) / [`with_audience`](Self::with_audience).
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.leeway = 0;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.validate_aud = true;
        self.validation.set_audience(&[audience]);
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let token_data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                _ => JwtError::EncodingError(e),
            })?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        if token_data.claims.sub.trim().is_empty() {
            return Err(JwtError::InvalidToken);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[async_trait]
impl AuthValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<AuthIdentity, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }

        let claims = JwtValidator::validate(self, token).map_err(|e| match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::InvalidToken => AuthError::InvalidToken("Token has no subject".to_string()),
            JwtError::EncodingError(e) => AuthError::InvalidToken(e.to_string()),
        })?;

        let mut identity = AuthIdentity::new(claims.sub.clone())
            .with_protocols(claims.protocols.clone())
            .with_metadata("iss".to_string(), claims.iss.clone())
            .with_metadata("exp".to_string(), claims.exp.to_string());

        if let Some(name) = claims.name {
            identity = identity.with_metadata("name".to_string(), name);
        }

        Ok(identity)
    }
}
