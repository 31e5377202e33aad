//! Request authentication and API rate limiting.
//!
//! A session token is read from, in order: the `token` query parameter, an
//! `Authorization: Bearer` header, or the `roomcast_session` cookie.

use axum::extract::{ConnectInfo, FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Uri};
use roomcast_core::{CoreError, Identity, Policy};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::{ApiError, ApiOk, RequestId};
use crate::routes::AppState;

/// Session cookie name.
pub const SESSION_COOKIE: &str = "roomcast_session";

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Find the session token in a request.
#[must_use]
pub fn session_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(headers))
        .or_else(|| cookie_token(headers))
        .filter(|t| !t.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_string())
        })
}

/// Best-effort client address, for limiting anonymous callers.
fn client_addr(parts: &Parts) -> String {
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map_or_else(|| "unknown".to_string(), |ip| ip.trim().to_string())
}

/// The caller of an API request, authenticated or not.
///
/// Extraction resolves the session (if a token was sent) and applies the
/// `api` rate limit per user, or per client address when anonymous.
#[derive(Debug, Clone)]
pub struct Caller {
    pub request_id: RequestId,
    pub identity: Option<Identity>,
}

impl Caller {
    /// Wrap `data` in a success envelope.
    #[must_use]
    pub fn ok<T>(&self, data: T) -> ApiOk<T> {
        ApiOk::new(self.request_id.clone(), data)
    }

    /// Wrap an error in a failure envelope.
    #[must_use]
    pub fn fail(&self, error: CoreError) -> ApiError {
        ApiError::new(self.request_id.clone(), error)
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(RequestId::generate);
        let fail = |error| ApiError::new(request_id.clone(), error);

        let identity = match session_token(&parts.headers, &parts.uri) {
            Some(token) => Some(
                state
                    .hub
                    .resolve_session(Some(&token))
                    .await
                    .map_err(fail)?,
            ),
            None => None,
        };

        let key = match &identity {
            Some(identity) => format!("user:{}", identity.user_id),
            None => format!("ip:{}", client_addr(parts)),
        };
        state
            .hub
            .limiter()
            .enforce(Policy::Api, &key)
            .await
            .map_err(fail)?;

        Ok(Self {
            request_id,
            identity,
        })
    }
}

/// An API caller with a valid session.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub request_id: RequestId,
    pub identity: Identity,
}

impl Authenticated {
    /// Wrap `data` in a success envelope.
    #[must_use]
    pub fn ok<T>(&self, data: T) -> ApiOk<T> {
        ApiOk::new(self.request_id.clone(), data)
    }

    /// Wrap an error in a failure envelope.
    #[must_use]
    pub fn fail(&self, error: CoreError) -> ApiError {
        ApiError::new(self.request_id.clone(), error)
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let caller = Caller::from_request_parts(parts, state).await?;
        match caller.identity {
            Some(identity) => Ok(Self {
                request_id: caller.request_id,
                identity,
            }),
            None => Err(ApiError::new(caller.request_id, CoreError::Unauthenticated)),
        }
    }
}
