//! Sliding window approximation over two fixed windows.

use async_trait::async_trait;
use tracing::debug;

use super::{window_key, RateLimitDecision, RateLimitStrategy, StrategyKind, WindowPosition};
use crate::clock::SharedClock;
use crate::error::Result;
use crate::storage::SharedStorage;

/// Blends the current window's count with the previous window's, weighted by
/// how much of the previous window still overlaps a trailing `period`.
///
/// The previous window is always `index - 1`, so a window contributes to
/// exactly one successor. Current counters live for two periods to remain
/// readable while they serve as the previous window.
pub struct SlidingWindow {
    storage: SharedStorage,
    namespace: String,
    limit: u64,
    period: u64,
    clock: SharedClock,
}

/// Counts observed at one instant.
#[derive(Debug, Clone, Copy)]
struct Observation {
    current: f64,
    previous: f64,
    position: WindowPosition,
}

impl SlidingWindow {
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

    fn keys(&self, identifier: &str, position: &WindowPosition) -> (String, String) {
        (
            window_key(&self.namespace, identifier, position.index),
            window_key(&self.namespace, identifier, position.index - 1),
        )
    }

    /// Lifetime of a window counter: its own window plus one as "previous".
    fn counter_ttl(&self) -> u64 {
        self.period.saturating_mul(2)
    }

    fn weight(&self, position: &WindowPosition) -> f64 {
        (1.0 - position.elapsed / self.period as f64).clamp(0.0, 1.0)
    }

    fn effective(&self, obs: &Observation) -> f64 {
        obs.current + obs.previous * self.weight(&obs.position)
    }

    /// Seconds until one more request fits.
    fn retry_after(&self, obs: &Observation) -> u64 {
        let limit = self.limit as f64;
        let room = limit - obs.current - 1.0;
        let position = &obs.position;

        // The current window alone is full; only the boundary helps.
        if room < 0.0 || obs.previous <= 0.0 {
            return position.reset_seconds;
        }

        let period = self.period as f64;
        let fits_at = period * (1.0 - room / obs.previous);
        let wait = (fits_at - position.elapsed).ceil().max(1.0) as u64;
        wait.min(position.reset_seconds)
    }

    fn decision(&self, obs: &Observation, allowed: bool) -> RateLimitDecision {
        let remaining = (self.limit as f64 - self.effective(obs)).max(0.0).floor() as u64;
        RateLimitDecision {
            allowed,
            limit: self.limit,
            remaining,
            reset_seconds: obs.position.reset_seconds,
            retry_after_seconds: (!allowed).then(|| self.retry_after(obs)),
        }
    }
}

#[async_trait]
impl RateLimitStrategy for SlidingWindow {
    async fn check(&self, identifier: &str) -> Result<RateLimitDecision> {
        let position = WindowPosition::at(self.clock.now(), self.period);
        let (current_key, previous_key) = self.keys(identifier, &position);

        let values = self
            .storage
            .get_many(&[current_key.as_str(), previous_key.as_str()])
            .await?;
        let read = |key: &str| values.get(key).map(|v| v.value_or(0.0)).unwrap_or(0.0);

        let obs = Observation {
            current: read(&current_key),
            previous: read(&previous_key),
            position,
        };
        let allowed = self.effective(&obs) + 1.0 <= self.limit as f64;
        Ok(self.decision(&obs, allowed))
    }

    async fn increment(&self, identifier: &str) -> Result<RateLimitDecision> {
        let position = WindowPosition::at(self.clock.now(), self.period);
        let (current_key, previous_key) = self.keys(identifier, &position);

        let ((current, _ttl), others) = self
            .storage
            .increment_and_get(&current_key, self.counter_ttl(), 1, &[previous_key.as_str()])
            .await?;
        let previous = others
            .get(&previous_key)
            .map(|v| v.value_or(0.0))
            .unwrap_or(0.0);

        let obs = Observation {
            current: current.max(0) as f64,
            previous,
            position,
        };
        let effective = self.effective(&obs);
        let allowed = effective <= self.limit as f64;

        debug!(
            key = %current_key,
            current = obs.current,
            previous = obs.previous,
            effective,
            limit = self.limit,
            allowed,
            "Sliding window increment"
        );
        Ok(self.decision(&obs, allowed))
    }

    async fn reset(&self, identifier: &str) -> Result<bool> {
        let position = WindowPosition::at(self.clock.now(), self.period);
        let (current_key, previous_key) = self.keys(identifier, &position);

        let (current, previous) = tokio::try_join!(
            self.storage.reset(&current_key),
            self.storage.reset(&previous_key),
        )?;
        Ok(current || previous)
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::SlidingWindow
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn limiter(limit: u64, period: u64, start: f64) -> (SlidingWindow, ManualClock) {
        let clock = ManualClock::new(start);
        let shared: SharedClock = Arc::new(clock.clone());
        let storage = Arc::new(MemoryStorage::with_clock(shared.clone()));
        (SlidingWindow::new(storage, "test", limit, period, shared), clock)
    }

    #[tokio::test]
    async fn test_previous_window_decays_linearly() {
        let (strategy, clock) = limiter(10, 60, 6000.0);
        for _ in 0..10 {
            assert!(strategy.increment("client").await.unwrap().allowed);
        }

        // Start of the next window: previous counts in full
        clock.set(6060.0);
        let start = strategy.check("client").await.unwrap();
        assert!(!start.allowed);
        assert_eq!(start.remaining, 0);

        // Midpoint: half the previous window remains
        clock.set(6090.0);
        let mid = strategy.check("client").await.unwrap();
        assert!(mid.allowed);
        assert_eq!(mid.remaining, 5);

        // End: previous window no longer contributes
        clock.set(6119.9);
        let end = strategy.check("client").await.unwrap();
        assert!(end.allowed);
        assert!(end.remaining >= 9);
    }

    #[tokio::test]
    async fn test_retry_after_follows_decay() {
        let (strategy, clock) = limiter(10, 60, 6000.0);
        for _ in 0..10 {
            strategy.increment("client").await.unwrap();
        }

        clock.set(6060.0);
        let denied = strategy.check("client").await.unwrap();
        assert_eq!(denied.retry_after_seconds, Some(6));

        clock.advance(6.0);
        assert!(strategy.increment("client").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_current_window_full_waits_for_boundary() {
        let (strategy, _clock) = limiter(3, 60, 6015.0);
        for _ in 0..3 {
            assert!(strategy.increment("client").await.unwrap().allowed);
        }

        let denied = strategy.increment("client").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_seconds, Some(45));
    }

    #[tokio::test]
    async fn test_two_windows_ago_does_not_count() {
        let (strategy, clock) = limiter(5, 60, 6000.0);
        for _ in 0..5 {
            strategy.increment("client").await.unwrap();
        }

        clock.set(6125.0);
        let decision = strategy.check("client").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
    }

    #[tokio::test]
    async fn test_huge_period_saturates_counter_ttl() {
        let (strategy, _clock) = limiter(3, u64::MAX, 6000.0);
        assert_eq!(strategy.counter_ttl(), u64::MAX);
        assert!(strategy.increment("client").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_clears_both_windows() {
        let (strategy, clock) = limiter(2, 60, 6000.0);
        strategy.increment("client").await.unwrap();
        strategy.increment("client").await.unwrap();
        clock.set(6061.0);
        strategy.increment("client").await.unwrap();

        assert!(strategy.reset("client").await.unwrap());
        let decision = strategy.check("client").await.unwrap();
        assert_eq!(decision.remaining, 2);
        assert!(!strategy.reset("client").await.unwrap());
    }
}
