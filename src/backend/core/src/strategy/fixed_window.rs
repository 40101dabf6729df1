//! Fixed window counter.

use async_trait::async_trait;
use tracing::debug;

use super::{window_key, RateLimitDecision, RateLimitStrategy, StrategyKind, WindowPosition};
use crate::clock::SharedClock;
use crate::error::Result;
use crate::storage::SharedStorage;

/// One counter per window `floor(now / period)`, expiring at the window edge.
///
/// Bursts of up to twice the limit across a window boundary are possible.
pub struct FixedWindow {
    storage: SharedStorage,
    namespace: String,
    limit: u64,
    period: u64,
    clock: SharedClock,
}

impl FixedWindow {
    pub fn new(
        storage: SharedStorage,
        namespace: impl Into<String>,
        limit: u64,
        period: u64,
        clock: SharedClock,
    ) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            limit,
            period: period.max(1),
            clock,
        }
    }

    fn decision(&self, count: u64, allowed: bool, position: &WindowPosition) -> RateLimitDecision {
        RateLimitDecision {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(count),
            reset_seconds: position.reset_seconds,
            retry_after_seconds: (!allowed).then_some(position.reset_seconds),
        }
    }
}

#[async_trait]
impl RateLimitStrategy for FixedWindow {
    async fn check(&self, identifier: &str) -> Result<RateLimitDecision> {
        let position = WindowPosition::at(self.clock.now(), self.period);
        let key = window_key(&self.namespace, identifier, position.index);

        let stored = self.storage.get(&key).await?;
        let count = stored.value_or(0.0).max(0.0) as u64;
        Ok(self.decision(count, count < self.limit, &position))
    }

    async fn increment(&self, identifier: &str) -> Result<RateLimitDecision> {
        let position = WindowPosition::at(self.clock.now(), self.period);
        let key = window_key(&self.namespace, identifier, position.index);

        let (count, _ttl) = self
            .storage
            .increment(&key, position.reset_seconds, 1)
            .await?;
        let count = count.max(0) as u64;
        let allowed = count <= self.limit;

        debug!(key = %key, count, limit = self.limit, allowed, "Fixed window increment");
        Ok(self.decision(count, allowed, &position))
    }

    async fn reset(&self, identifier: &str) -> Result<bool> {
        let position = WindowPosition::at(self.clock.now(), self.period);
        self.storage
            .reset(&window_key(&self.namespace, identifier, position.index))
            .await
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::FixedWindow
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}
