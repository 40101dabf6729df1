//! Rate limiting algorithms.
//!
//! Each strategy is a stateless wrapper around a [`StorageBackend`]:
//! - **FixedWindow**: one counter per calendar-aligned window
//! - **SlidingWindow**: current window plus a linearly decaying previous window
//! - **TokenBucket**: continuously refilled reservoir, drained one token per request
//!
//! `check` is read-only and answers "would one more request be admitted now";
//! `increment` consumes and returns the authoritative decision.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use self::fixed_window::FixedWindow;
pub use self::sliding_window::SlidingWindow;
pub use self::token_bucket::TokenBucket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::config::LimitParams;
use crate::error::{RateLimitError, Result};
use crate::storage::SharedStorage;

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a rate limit evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitDecision {
    /// Convert a denial into the error carried to the HTTP boundary.
    pub fn into_exceeded(self) -> RateLimitError {
        RateLimitError::RateLimitExceeded {
            limit: self.limit,
            remaining: self.remaining,
            reset_secs: self.reset_seconds,
            retry_after_secs: self.retry_after_seconds,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Strategy Kinds
// ═══════════════════════════════════════════════════════════════════════════════

/// Configured algorithm selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

impl StrategyKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FixedWindow => "fixed_window",
            Self::SlidingWindow => "sliding_window",
            Self::TokenBucket => "token_bucket",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved algorithm with only the parameters it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategySpec {
    FixedWindow { limit: u64, period: u64 },
    SlidingWindow { limit: u64, period: u64 },
    TokenBucket { rate_limit: u64, period: u64, capacity: u64 },
}

impl StrategySpec {
    /// Resolve `kind` against concrete limits. Bucket capacity defaults to the
    /// rate limit.
    pub fn resolve(kind: StrategyKind, limits: &LimitParams) -> Self {
        match kind {
            StrategyKind::FixedWindow => Self::FixedWindow {
                limit: limits.rate_limit,
                period: limits.period_seconds,
            },
            StrategyKind::SlidingWindow => Self::SlidingWindow {
                limit: limits.rate_limit,
                period: limits.period_seconds,
            },
            StrategyKind::TokenBucket => Self::TokenBucket {
                rate_limit: limits.rate_limit,
                period: limits.period_seconds,
                capacity: limits.bucket_capacity.unwrap_or(limits.rate_limit),
            },
        }
    }

    pub const fn kind(&self) -> StrategyKind {
        match self {
            Self::FixedWindow { .. } => StrategyKind::FixedWindow,
            Self::SlidingWindow { .. } => StrategyKind::SlidingWindow,
            Self::TokenBucket { .. } => StrategyKind::TokenBucket,
        }
    }

    /// Instantiate the algorithm against `storage`, keys scoped by `namespace`.
    pub fn build(
        &self,
        storage: SharedStorage,
        namespace: impl Into<String>,
        clock: SharedClock,
    ) -> SharedStrategy {
        let namespace = namespace.into();
        match *self {
            Self::FixedWindow { limit, period } => {
                Arc::new(FixedWindow::new(storage, namespace, limit, period, clock))
            }
            Self::SlidingWindow { limit, period } => {
                Arc::new(SlidingWindow::new(storage, namespace, limit, period, clock))
            }
            Self::TokenBucket {
                rate_limit,
                period,
                capacity,
            } => Arc::new(TokenBucket::new(
                storage, namespace, rate_limit, period, capacity, clock,
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Strategy Trait
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait RateLimitStrategy: Send + Sync {
    /// Evaluate without consuming.
    async fn check(&self, identifier: &str) -> Result<RateLimitDecision>;

    /// Consume one request and decide.
    async fn increment(&self, identifier: &str) -> Result<RateLimitDecision>;

    /// Restore the full limit for `identifier`. Returns whether it had any state.
    async fn reset(&self, identifier: &str) -> Result<bool>;

    fn kind(&self) -> StrategyKind;

    fn limit(&self) -> u64;

    fn namespace(&self) -> &str;
}

pub type SharedStrategy = Arc<dyn RateLimitStrategy>;

// ═══════════════════════════════════════════════════════════════════════════════
// Window Arithmetic
// ═══════════════════════════════════════════════════════════════════════════════

/// Position of `now` within calendar-aligned windows of `period` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowPosition {
    pub index: i64,
    /// Seconds since the window started
    pub elapsed: f64,
    /// Whole seconds until the window ends, at least 1
    pub reset_seconds: u64,
}

impl WindowPosition {
    pub fn at(now: f64, period: u64) -> Self {
        let period = period as f64;
        let index = (now / period).floor();
        let elapsed = (now - index * period).clamp(0.0, period);
        Self {
            index: index as i64,
            elapsed,
            reset_seconds: ((period - elapsed).ceil() as u64).max(1),
        }
    }
}

pub(crate) fn window_key(namespace: &str, identifier: &str, index: i64) -> String {
    format!("{}:{}:{}", namespace, identifier, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_position() {
        let pos = WindowPosition::at(125.0, 60);
        assert_eq!(pos.index, 2);
        assert!((pos.elapsed - 5.0).abs() < 1e-9);
        assert_eq!(pos.reset_seconds, 55);

        let edge = WindowPosition::at(120.0, 60);
        assert_eq!(edge.index, 2);
        assert_eq!(edge.reset_seconds, 60);

        let fractional = WindowPosition::at(179.5, 60);
        assert_eq!(fractional.reset_seconds, 1);
    }

    #[test]
    fn test_resolve_spec() {
        let limits = LimitParams {
            rate_limit: 60,
            period_seconds: 60,
            bucket_capacity: None,
        };
        assert_eq!(
            StrategySpec::resolve(StrategyKind::TokenBucket, &limits),
            StrategySpec::TokenBucket {
                rate_limit: 60,
                period: 60,
                capacity: 60
            }
        );
        assert_eq!(
            StrategySpec::resolve(StrategyKind::SlidingWindow, &limits).kind(),
            StrategyKind::SlidingWindow
        );
    }

    #[test]
    fn test_kind_serde() {
        let kind: StrategyKind = serde_json::from_str("\"token_bucket\"").unwrap();
        assert_eq!(kind, StrategyKind::TokenBucket);
        assert_eq!(StrategyKind::SlidingWindow.to_string(), "sliding_window");
    }

    #[test]
    fn test_decision_into_exceeded() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_seconds: 30,
            retry_after_seconds: Some(30),
        };
        match decision.into_exceeded() {
            RateLimitError::RateLimitExceeded {
                limit,
                retry_after_secs,
                ..
            } => {
                assert_eq!(limit, 5);
                assert_eq!(retry_after_secs, Some(30));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
