//! Response envelope and error mapping for the HTTP API.
//!
//! Every response body has the shape
//! `{"success", "data"?, "error"?: {"code", "message", "retryAfterSecs"?}, "requestId"}`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use roomcast_core::{CoreError, ErrorKind, RoomId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use tracing::warn;
use uuid::Uuid;

/// Correlation id of one request, echoed in the body and `x-request-id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(RequestId::generate))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    request_id: String,
}

/// A successful response.
#[derive(Debug)]
pub struct ApiOk<T> {
    request_id: RequestId,
    status: StatusCode,
    data: T,
}

impl<T> ApiOk<T> {
    #[must_use]
    pub fn new(request_id: RequestId, data: T) -> Self {
        Self {
            request_id,
            status: StatusCode::OK,
            data,
        }
    }

    /// Respond with `201 Created`.
    #[must_use]
    pub fn created(mut self) -> Self {
        self.status = StatusCode::CREATED;
        self
    }
}

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        let body = Envelope {
            success: true,
            data: Some(self.data),
            error: None,
            request_id: self.request_id.0,
        };
        (self.status, Json(body)).into_response()
    }
}

/// A failed response.
#[derive(Debug)]
pub struct ApiError {
    pub request_id: RequestId,
    pub error: CoreError,
}

impl ApiError {
    #[must_use]
    pub fn new(request_id: RequestId, error: CoreError) -> Self {
        Self { request_id, error }
    }
}

/// HTTP status for a service error.
#[must_use]
pub fn status_for(error: &CoreError) -> StatusCode {
    match error {
        CoreError::Expired => StatusCode::GONE,
        other => match other.kind() {
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        let retry_after = match &self.error {
            CoreError::RateLimited(info) => Some(info.retry_after_secs),
            _ => None,
        };

        if status == StatusCode::SERVICE_UNAVAILABLE {
            warn!(request_id = %self.request_id.0, error = %self.error, "Request failed");
        }
        roomcast_core::metrics::record_error(self.error.code());

        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: self.error.code(),
                message: self.error.to_string(),
                retry_after_secs: retry_after,
            }),
            request_id: self.request_id.0,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Handler result.
pub type ApiResult<T> = Result<ApiOk<T>, ApiError>;

/// JSON body extractor whose rejections use the error envelope.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(RequestId::generate);

        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::new(request_id, invalid_body(&rejection))),
        }
    }
}

fn invalid_body(rejection: &JsonRejection) -> CoreError {
    CoreError::invalid(rejection.body_text())
}

/// Parse a room id path segment. Malformed ids cannot name a room.
///
/// # Errors
///
/// Returns `NotFound` for anything that is not a UUID.
pub fn parse_room_id(raw: &str) -> Result<RoomId, CoreError> {
    Uuid::parse_str(raw).map_err(|_| CoreError::NotFound("Room"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use roomcast_core::RateLimitInfo;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&CoreError::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&CoreError::NotFound("Room")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&CoreError::Expired), StatusCode::GONE);
        assert_eq!(status_for(&CoreError::NotOwner), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&CoreError::NotMember), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&CoreError::Full), StatusCode::CONFLICT);
        assert_eq!(status_for(&CoreError::UsageExceeded), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&CoreError::InvalidCapacity("1".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CoreError::Unavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let error = CoreError::RateLimited(RateLimitInfo {
            policy: "api",
            limit: 100,
            retry_after_secs: 42,
            reset_at: Utc::now(),
        });

        let response = ApiError::new(RequestId("req-1".into()), error).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_parse_room_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_room_id(&id.to_string()), Ok(id));
        assert_eq!(parse_room_id("nope"), Err(CoreError::NotFound("Room")));
    }
}
