//! Rolling-window request statistics.
//!
//! Advisory only: nothing here feeds back into allow/deny decisions. A ring of
//! one-second buckets covers the recent window; per identifier, strategy and
//! route totals grow for the collector's lifetime.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::clock::SharedClock;

/// Entries reported in each top-N list.
const TOP_N: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    requests: u64,
    allowed: u64,
    limited: u64,
}

/// Cumulative counts for one strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StrategyCounts {
    pub requests: u64,
    pub allowed: u64,
    pub limited: u64,
}

#[derive(Debug, Default)]
struct CollectorState {
    buckets: Vec<Bucket>,
    /// Index of the bucket for `last_second`
    cursor: usize,
    last_second: Option<i64>,
    limited_by_identifier: HashMap<String, u64>,
    by_strategy: HashMap<String, StrategyCounts>,
    requests_by_route: HashMap<String, u64>,
}

impl CollectorState {
    fn new(window: usize) -> Self {
        Self {
            buckets: vec![Bucket::default(); window],
            ..Default::default()
        }
    }

    /// Advance to `second`, zeroing every slot rotated through.
    fn rotate(&mut self, second: i64) {
        let window = self.buckets.len();
        let Some(last) = self.last_second else {
            self.last_second = Some(second);
            return;
        };

        let elapsed = second - last;
        if elapsed <= 0 {
            return;
        }

        if elapsed as usize >= window {
            self.buckets.fill(Bucket::default());
            self.cursor = 0;
        } else {
            for _ in 0..elapsed {
                self.cursor = (self.cursor + 1) % window;
                self.buckets[self.cursor] = Bucket::default();
            }
        }
        self.last_second = Some(second);
    }
}

/// Point-in-time view of the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub window_seconds: u64,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub limited_requests: u64,
    pub requests_per_second: f64,
    pub limited_percentage: f64,
    pub by_strategy: BTreeMap<String, StrategyCounts>,
    pub top_limited_identifiers: Vec<(String, u64)>,
    pub top_routes: Vec<(String, u64)>,
}

/// Thread-safe rolling metrics, one coarse lock for everything.
pub struct MetricsCollector {
    window_seconds: u64,
    clock: SharedClock,
    state: Mutex<CollectorState>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("window_seconds", &self.window_seconds)
            .finish()
    }
}

impl MetricsCollector {
    pub fn new(window_seconds: u64, clock: SharedClock) -> Self {
        let window_seconds = window_seconds.max(1);
        Self {
            window_seconds,
            clock,
            state: Mutex::new(CollectorState::new(window_seconds as usize)),
        }
    }

    fn current_second(&self) -> i64 {
        self.clock.now().floor() as i64
    }

    pub fn record_request(&self, allowed: bool, identifier: &str, strategy: &str, route: &str) {
        let second = self.current_second();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.rotate(second);

        let cursor = state.cursor;
        let bucket = &mut state.buckets[cursor];
        bucket.requests += 1;
        if allowed {
            bucket.allowed += 1;
        } else {
            bucket.limited += 1;
            *state
                .limited_by_identifier
                .entry(identifier.to_string())
                .or_default() += 1;
        }

        let counts = state.by_strategy.entry(strategy.to_string()).or_default();
        counts.requests += 1;
        if allowed {
            counts.allowed += 1;
        } else {
            counts.limited += 1;
        }

        *state.requests_by_route.entry(route.to_string()).or_default() += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let second = self.current_second();
        let mut state = self.state.lock();
        state.rotate(second);

        let totals = state.buckets.iter().fold(Bucket::default(), |acc, b| Bucket {
            requests: acc.requests + b.requests,
            allowed: acc.allowed + b.allowed,
            limited: acc.limited + b.limited,
        });

        let limited_percentage = if totals.requests > 0 {
            totals.limited as f64 / totals.requests as f64 * 100.0
        } else {
            0.0
        };

        MetricsSnapshot {
            window_seconds: self.window_seconds,
            total_requests: totals.requests,
            allowed_requests: totals.allowed,
            limited_requests: totals.limited,
            requests_per_second: totals.requests as f64 / self.window_seconds as f64,
            limited_percentage,
            by_strategy: state
                .by_strategy
                .iter()
                .map(|(name, counts)| (name.clone(), *counts))
                .collect(),
            top_limited_identifiers: top_n(&state.limited_by_identifier),
            top_routes: top_n(&state.requests_by_route),
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = CollectorState::new(self.window_seconds as usize);
    }
}

/// Highest counts first, ties broken by name for stable output.
fn top_n(counts: &HashMap<String, u64>) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts
        .iter()
        .map(|(name, count)| (name.clone(), *count))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(TOP_N);
    entries
}
