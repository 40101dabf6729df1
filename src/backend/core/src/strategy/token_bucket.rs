//! Token bucket.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{RateLimitDecision, RateLimitStrategy, StrategyKind};
use crate::clock::SharedClock;
use crate::error::{RateLimitError, Result};
use crate::storage::{Precondition, SharedStorage};

/// Optimistic update attempts before giving up on a contended bucket.
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Reservoir of `capacity` tokens refilled at `rate_limit / period` tokens per
/// second.
///
/// State lives under two keys, `{ns}:{id}:tokens` and `{ns}:{id}:ts`, always
/// written together and guarded by the values they were computed from. A
/// granted request always changes the pair: either time moved or a token was
/// taken.
pub struct TokenBucket {
    storage: SharedStorage,
    namespace: String,
    capacity: f64,
    refill_rate: f64,
    clock: SharedClock,
}

/// Bucket state as read, and refilled up to `now`.
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    stored_tokens: Option<f64>,
    stored_at: Option<f64>,
    tokens: f64,
    now: f64,
}

impl TokenBucket {
    pub fn new(
        storage: SharedStorage,
        namespace: impl Into<String>,
        rate_limit: u64,
        period: u64,
        capacity: u64,
        clock: SharedClock,
    ) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            capacity: capacity.max(1) as f64,
            refill_rate: rate_limit.max(1) as f64 / period.max(1) as f64,
            clock,
        }
    }

    fn keys(&self, identifier: &str) -> (String, String) {
        (
            format!("{}:{}:tokens", self.namespace, identifier),
            format!("{}:{}:ts", self.namespace, identifier),
        )
    }

    /// Seconds for an empty bucket to refill completely, plus one. Past that an
    /// absent bucket is indistinguishable from a full one.
    fn state_ttl(&self) -> u64 {
        (self.capacity / self.refill_rate).ceil() as u64 + 1
    }

    async fn snapshot(&self, tokens_key: &str, ts_key: &str) -> Result<Snapshot> {
        let now = self.clock.now();
        let values = self.storage.get_many(&[tokens_key, ts_key]).await?;
        let stored_tokens = values.get(tokens_key).and_then(|v| v.value);
        let stored_at = values.get(ts_key).and_then(|v| v.value);

        let tokens = match (stored_tokens, stored_at) {
            (Some(tokens), Some(at)) => {
                let elapsed = (now - at).max(0.0);
                (tokens + elapsed * self.refill_rate).min(self.capacity)
            }
            _ => self.capacity,
        };

        Ok(Snapshot {
            stored_tokens,
            stored_at,
            tokens,
            now,
        })
    }

    fn decision(&self, tokens: f64, allowed: bool) -> RateLimitDecision {
        let retry_after = (tokens < 1.0)
            .then(|| (((1.0 - tokens) / self.refill_rate).ceil() as u64).max(1));
        let reset = ((self.capacity - tokens).max(0.0) / self.refill_rate).ceil() as u64;

        RateLimitDecision {
            allowed,
            limit: self.capacity as u64,
            remaining: tokens.max(0.0).floor() as u64,
            reset_seconds: reset,
            retry_after_seconds: if allowed { None } else { retry_after },
        }
    }
}

#[async_trait]
impl RateLimitStrategy for TokenBucket {
    async fn check(&self, identifier: &str) -> Result<RateLimitDecision> {
        let (tokens_key, ts_key) = self.keys(identifier);
        let snapshot = self.snapshot(&tokens_key, &ts_key).await?;
        Ok(self.decision(snapshot.tokens, snapshot.tokens >= 1.0))
    }

    async fn increment(&self, identifier: &str) -> Result<RateLimitDecision> {
        let (tokens_key, ts_key) = self.keys(identifier);

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let snapshot = self.snapshot(&tokens_key, &ts_key).await?;
            if snapshot.tokens < 1.0 {
                debug!(key = %tokens_key, tokens = snapshot.tokens, "Token bucket empty");
                return Ok(self.decision(snapshot.tokens, false));
            }

            let remaining = snapshot.tokens - 1.0;
            let stamped_at = snapshot
                .stored_at
                .map_or(snapshot.now, |at| at.max(snapshot.now));
            let guards = [
                Precondition::new(tokens_key.as_str(), snapshot.stored_tokens),
                Precondition::new(ts_key.as_str(), snapshot.stored_at),
            ];
            let values = [
                (tokens_key.clone(), remaining),
                (ts_key.clone(), stamped_at),
            ];

            if self
                .storage
                .set_many(&values, self.state_ttl(), &guards)
                .await?
            {
                debug!(key = %tokens_key, tokens = remaining, attempt, "Token bucket granted");
                return Ok(self.decision(remaining, true));
            }
        }

        warn!(key = %tokens_key, attempts = MAX_UPDATE_ATTEMPTS, "Token bucket update contended");
        Err(RateLimitError::strategy("token bucket contention"))
    }

    /// Refill the bucket to capacity. An identifier without state is already
    /// full and is left untouched.
    async fn reset(&self, identifier: &str) -> Result<bool> {
        let (tokens_key, ts_key) = self.keys(identifier);
        let existing = self
            .storage
            .get_many(&[tokens_key.as_str(), ts_key.as_str()])
            .await?;
        if existing.values().all(|stored| stored.value.is_none()) {
            return Ok(false);
        }

        let now = self.clock.now();
        self.storage
            .set_many(
                &[(tokens_key, self.capacity), (ts_key, now)],
                self.state_ttl(),
                &[],
            )
            .await
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::TokenBucket
    }

    fn limit(&self) -> u64 {
        self.capacity as u64
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}
