//! Token validation seam for the authenticated conduit operations.
//!
//! Tokens are minted and checked outside the core; the dispatcher only
//! needs a yes/no plus the caller identity for parameter substitution.
//! Hosts plug their validator in when building the [`super::Conduit`].

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// A validated caller identity.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Stable subject identifier.
    pub subject: String,
    /// Additional claims available to `identity.*` parameters.
    pub claims: serde_json::Map<String, serde_json::Value>,
}

/// Raised by validators for any invalid, expired, or unknown token.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("token rejected")]
pub struct TokenRejected;

/// The validation seam.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Check a token and return the identity it carries.
    ///
    /// # Errors
    /// [`TokenRejected`] for any token that does not validate.
    async fn validate(&self, token: &str) -> Result<Identity, TokenRejected>;
}

/// Validator that rejects everything; the default until a host installs
/// its own.
pub struct RejectAll;

#[async_trait]
impl TokenValidator for RejectAll {
    async fn validate(&self, _token: &str) -> Result<Identity, TokenRejected> {
        Err(TokenRejected)
    }
}

/// Fixed-token validator for small deployments and tests.
#[derive(Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    /// Register `token` as belonging to `identity`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn validate(&self, token: &str) -> Result<Identity, TokenRejected> {
        self.tokens.get(token).cloned().ok_or(TokenRejected)
    }
}
