//! Session gate: resolves a session token to an identity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::CoreError;
use crate::room::UserId;

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// Session gate errors.
#[derive(Debug, Error)]
pub enum GateError {
    /// The session backend could not be reached.
    #[error("Session store unavailable: {0}")]
    Unavailable(String),
}

impl From<GateError> for CoreError {
    fn from(err: GateError) -> Self {
        CoreError::Unavailable(err.to_string())
    }
}

/// Validates session tokens.
#[async_trait]
pub trait SessionGate: Send + Sync {
    /// Resolve a token. `Ok(None)` means the token is unknown or expired.
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>, GateError>;
}

/// Fixed token table, for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionGate {
    sessions: HashMap<String, Identity>,
}

impl StaticSessionGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session.
    #[must_use]
    pub fn with_session(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.sessions.insert(token.into(), identity);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        self.sessions.insert(token.into(), identity);
    }
}

#[async_trait]
impl SessionGate for StaticSessionGate {
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>, GateError> {
        Ok(self.sessions.get(token).cloned())
    }
}
