//! Sliding-window rate limiting.
//!
//! Each policy allows `max` requests per `window` per identity. Window state
//! lives in a [`WindowStore`] so limits hold across processes. When the store
//! fails or is slow, the check fails open: the request is allowed and the
//! failure is logged and counted.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{CoreError, RateLimitInfo};
use crate::metrics;

/// Window store errors.
#[derive(Debug, Error)]
pub enum WindowError {
    /// The backend could not be reached.
    #[error("Window store unavailable: {0}")]
    Unavailable(String),
}

/// A rate-limit policy.
///
/// `Api` and `Messages` are enforced here. `Login` and `Registration` guard
/// the credential service behind [`SessionGate`](crate::SessionGate), which
/// calls [`RateLimiter::enforce`] through `Hub::limiter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Login,
    Registration,
    Api,
    Messages,
}

impl Policy {
    /// Key prefix and metric label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Login => "login",
            Policy::Registration => "registration",
            Policy::Api => "api",
            Policy::Messages => "messages",
        }
    }
}

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRule {
    pub max: u32,
    pub window: Duration,
}

impl LimitRule {
    #[must_use]
    pub const fn new(max: u32, window_secs: u64) -> Self {
        Self {
            max,
            window: Duration::from_secs(window_secs),
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login: LimitRule,
    pub registration: LimitRule,
    pub api: LimitRule,
    pub messages: LimitRule,
    /// Deadline for each window store call.
    pub store_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login: LimitRule::new(5, 15 * 60),
            registration: LimitRule::new(3, 60 * 60),
            api: LimitRule::new(100, 15 * 60),
            messages: LimitRule::new(30, 10),
            store_timeout: Duration::from_millis(100),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn rule(&self, policy: Policy) -> LimitRule {
        match policy {
            Policy::Login => self.login,
            Policy::Registration => self.registration,
            Policy::Api => self.api,
            Policy::Messages => self.messages,
        }
    }
}

/// A window store's answer for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Requests in the window, including this one if it was allowed.
    pub count: u32,
    /// Timestamp of the oldest request still in the window, in ms.
    pub oldest_ms: Option<i64>,
}

/// Shared sliding-window counters.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Drop entries older than the window, then record `now_ms` if fewer than
    /// `max` remain. Atomic per key.
    async fn acquire(&self, key: &str, now_ms: i64, window_ms: i64, max: u32) -> Result<WindowDecision, WindowError>;

    /// Forget all entries for a key.
    async fn reset(&self, key: &str) -> Result<(), WindowError>;
}

/// In-process sliding log.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, VecDeque<i64>>,
}

impl MemoryWindowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop keys whose windows have emptied.
    pub fn prune(&self, now_ms: i64, max_window_ms: i64) {
        self.windows.retain(|_, log| {
            log.back()
                .is_some_and(|last| *last > now_ms - max_window_ms)
        });
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn acquire(&self, key: &str, now_ms: i64, window_ms: i64, max: u32) -> Result<WindowDecision, WindowError> {
        let mut log = self.windows.entry(key.to_string()).or_default();
        let cutoff = now_ms - window_ms;
        while log.front().is_some_and(|t| *t <= cutoff) {
            log.pop_front();
        }

        let allowed = log.len() < max as usize;
        if allowed {
            log.push_back(now_ms);
        }

        Ok(WindowDecision {
            allowed,
            count: u32::try_from(log.len()).unwrap_or(u32::MAX),
            oldest_ms: log.front().copied(),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), WindowError> {
        self.windows.remove(key);
        Ok(())
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited(RateLimitInfo),
}

/// Rate limiter over a shared window store.
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn WindowStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a request against `policy` for `identity`.
    ///
    /// Never fails: store errors and timeouts allow the request.
    pub async fn check(&self, policy: Policy, identity: &str) -> RateDecision {
        let rule = self.config.rule(policy);
        let key = window_key(policy, identity);
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = i64::try_from(rule.window.as_millis()).unwrap_or(i64::MAX);

        let decision = match tokio::time::timeout(
            self.config.store_timeout,
            self.store.acquire(&key, now_ms, window_ms, rule.max),
        )
        .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(policy = policy.as_str(), error = %e, "Rate limit check failed, allowing request");
                metrics::record_rate_limit_fail_open(policy.as_str());
                return RateDecision::Allowed { remaining: rule.max };
            }
            Err(_) => {
                warn!(policy = policy.as_str(), "Rate limit check timed out, allowing request");
                metrics::record_rate_limit_fail_open(policy.as_str());
                return RateDecision::Allowed { remaining: rule.max };
            }
        };

        if decision.allowed {
            return RateDecision::Allowed {
                remaining: rule.max.saturating_sub(decision.count),
            };
        }

        let reset_ms = decision.oldest_ms.unwrap_or(now_ms) + window_ms;
        let wait_ms = (reset_ms - now_ms).max(0);
        let retry_after_secs = u64::try_from((wait_ms + 999) / 1000).unwrap_or(1).max(1);
        let reset_at = Utc
            .timestamp_millis_opt(reset_ms)
            .single()
            .unwrap_or_else(Utc::now);

        metrics::record_rate_limited(policy.as_str());
        debug!(policy = policy.as_str(), identity, retry_after_secs, "Rate limited");

        RateDecision::Limited(RateLimitInfo {
            policy: policy.as_str(),
            limit: rule.max,
            retry_after_secs,
            reset_at,
        })
    }

    /// Like [`RateLimiter::check`], but rejects with `RateLimited`.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` when the window is full.
    pub async fn enforce(&self, policy: Policy, identity: &str) -> Result<(), CoreError> {
        match self.check(policy, identity).await {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Limited(info) => Err(CoreError::RateLimited(info)),
        }
    }

    /// Clear an identity's window, e.g. after a successful login.
    pub async fn reset(&self, policy: Policy, identity: &str) {
        let key = window_key(policy, identity);
        match tokio::time::timeout(self.config.store_timeout, self.store.reset(&key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(policy = policy.as_str(), error = %e, "Rate limit reset failed"),
            Err(_) => warn!(policy = policy.as_str(), "Rate limit reset timed out"),
        }
    }
}

/// Store key for a policy and identity.
#[must_use]
pub fn window_key(policy: Policy, identity: &str) -> String {
    format!("ratelimit:{}:{}", policy.as_str(), identity)
}
