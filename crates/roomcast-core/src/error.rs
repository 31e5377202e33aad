//! Error taxonomy shared by every roomcast service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Broad error category, used to pick transport-level status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    NotFound,
    Forbidden,
    Conflict,
    InvalidInput,
    RateLimited,
    Unavailable,
}

/// Details of a rate-limit rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    /// Policy that rejected the request.
    pub policy: &'static str,
    /// Allowed requests per window.
    pub limit: u32,
    /// Seconds until another request will be accepted.
    pub retry_after_secs: u64,
    /// When the oldest counted request leaves the window.
    pub reset_at: DateTime<Utc>,
}

/// Errors returned by roomcast services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// No identity attached to the connection or the session is invalid.
    #[error("Authentication required")]
    Unauthenticated,

    /// The entity does not exist or is hidden from the caller.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The caller is not the room owner.
    #[error("Only the room owner can do that")]
    NotOwner,

    /// The caller lacks a required permission.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The caller is not a member of the room.
    #[error("Not a member of this room")]
    NotMember,

    /// The caller is already a member of the room.
    #[error("Already a member of this room")]
    AlreadyMember,

    /// The room has reached its capacity.
    #[error("Room is full")]
    Full,

    /// The invite has reached its usage limit.
    #[error("Invite usage limit reached")]
    UsageExceeded,

    /// The invite has expired.
    #[error("Invite has expired")]
    Expired,

    /// A capacity outside the allowed range or below the member count.
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    /// Malformed or out-of-range input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Too many requests.
    #[error("Rate limit exceeded, retry in {}s", .0.retry_after_secs)]
    RateLimited(RateLimitInfo),

    /// A collaborator (store, ledger, broker, gate) is unreachable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl CoreError {
    /// Stable wire code reported to clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unauthenticated => "UNAUTHENTICATED",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::NotOwner => "NOT_OWNER",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::NotMember => "NOT_MEMBER",
            CoreError::AlreadyMember => "ALREADY_MEMBER",
            CoreError::Full => "ROOM_FULL",
            CoreError::UsageExceeded => "USAGE_EXCEEDED",
            CoreError::Expired => "INVITE_EXPIRED",
            CoreError::InvalidCapacity(_) => "INVALID_CAPACITY",
            CoreError::InvalidInput(_) => "INVALID_INPUT",
            CoreError::RateLimited(_) => "RATE_LIMITED",
            CoreError::Unavailable(_) => "UNAVAILABLE",
        }
    }

    /// Error category.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Unauthenticated => ErrorKind::Unauthenticated,
            CoreError::NotFound(_) | CoreError::Expired => ErrorKind::NotFound,
            CoreError::NotOwner | CoreError::Forbidden(_) | CoreError::NotMember => {
                ErrorKind::Forbidden
            }
            CoreError::AlreadyMember | CoreError::Full | CoreError::UsageExceeded => {
                ErrorKind::Conflict
            }
            CoreError::InvalidCapacity(_) | CoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            CoreError::RateLimited(_) => ErrorKind::RateLimited,
            CoreError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Shorthand for an `InvalidInput` error.
    pub fn invalid(message: impl Into<String>) -> Self {
        CoreError::InvalidInput(message.into())
    }
}

/// Await a collaborator call, mapping a timeout to `Unavailable`.
///
/// # Errors
///
/// Returns the call's own error, or `Unavailable` if it does not finish in time.
pub async fn within<T, E, F>(timeout: Duration, what: &'static str, fut: F) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<CoreError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(CoreError::Unavailable(format!("{what} timed out"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_kinds() {
        assert_eq!(CoreError::Full.code(), "ROOM_FULL");
        assert_eq!(CoreError::Full.kind(), ErrorKind::Conflict);
        assert_eq!(CoreError::NotOwner.kind(), ErrorKind::Forbidden);
        assert_eq!(CoreError::Expired.kind(), ErrorKind::NotFound);
        assert_eq!(
            CoreError::Unavailable("redis".into()).kind(),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(CoreError::NotFound("Room").to_string(), "Room not found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_times_out() {
        let result: Result<(), CoreError> = within(Duration::from_millis(50), "store", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), CoreError>(())
        })
        .await;

        assert_eq!(
            result,
            Err(CoreError::Unavailable("store timed out".into()))
        );
    }
}
