//! Session lookups against the auth service's Redis session records.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use roomcast_core::{GateError, Identity, SessionGate};
use tracing::warn;

fn session_key(token: &str) -> String {
    format!("session:{token}")
}

/// Resolves `session:{token}` JSON records of the form `{"userId", "username"}`.
#[derive(Clone)]
pub struct RedisSessionGate {
    conn: ConnectionManager,
}

impl RedisSessionGate {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SessionGate for RedisSessionGate {
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>, GateError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(session_key(token))
            .await
            .map_err(|e| GateError::Unavailable(e.to_string()))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<Identity>(&raw) {
            Ok(identity) => Ok(Some(identity)),
            Err(e) => {
                // Unreadable sessions are treated as absent.
                warn!(error = %e, "Malformed session record");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key() {
        assert_eq!(session_key("t0k"), "session:t0k");
    }

    #[test]
    fn test_session_record_shape() {
        let identity: Identity = serde_json::from_str(r#"{"userId":9,"username":"ida"}"#).unwrap();
        assert_eq!(identity, Identity::new(9, "ida"));
    }
}
