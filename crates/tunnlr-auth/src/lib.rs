//! Credential validation for tunnel connections
//!
//! The relay only needs `validate(token) -> owner identity`; [`JwtValidator`] is the bundled
//! implementation (HS256 with issuer/audience checks).

pub mod jwt;
pub mod validator;

pub use jwt::{JwtClaims, JwtError, JwtValidator};
pub use validator::{AuthError, AuthIdentity, AuthValidator};

// Re-export useful types
pub use async_trait::async_trait;

/// Default `iss` claim for tokens minted for the relay
pub const DEFAULT_ISSUER: &str = "tunnlr-auth";

/// Default `aud` claim for tokens minted for the relay
pub const DEFAULT_AUDIENCE: &str = "tunnlr-relay";
