//! Counter storage backends.
//!
//! Strategies keep their state in a [`StorageBackend`]:
//! - **MemoryStorage**: process-local table behind one lock, swept periodically
//! - **RedisStorage**: shared across instances, atomic via Lua and MULTI/EXEC
//!
//! Every operation is atomic per key. `set_many` guarded by [`Precondition`]s is
//! the compare-and-set primitive the token bucket uses to update its pair of keys.

mod memory;
mod redis;
mod retry;

pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;
pub use self::retry::RetryPolicy;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════════
// Stored Values
// ═══════════════════════════════════════════════════════════════════════════════

/// A value read from storage together with its remaining lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StoredValue {
    /// Numeric value, `None` when the key is absent or expired
    pub value: Option<f64>,

    /// Remaining lifetime in whole seconds, `None` when absent or without expiry
    pub ttl: Option<u64>,
}

impl StoredValue {
    /// An absent key.
    pub const fn missing() -> Self {
        Self {
            value: None,
            ttl: None,
        }
    }

    /// Value or a fallback when absent.
    pub fn value_or(&self, default: f64) -> f64 {
        self.value.unwrap_or(default)
    }
}

/// One guard of a conditional multi-key write.
///
/// The write only happens while `key` still holds `expected`
/// (`None` meaning the key must be absent).
#[derive(Debug, Clone, PartialEq)]
pub struct Precondition {
    pub key: String,
    pub expected: Option<f64>,
}

impl Precondition {
    pub fn new(key: impl Into<String>, expected: Option<f64>) -> Self {
        Self {
            key: key.into(),
            expected,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for rate limit counter storage.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Atomically add `amount` to `key`, creating it at 0 first if absent.
    ///
    /// The expiry is set only when the key is created; existing keys keep
    /// their TTL. Returns the new value and the remaining TTL in seconds.
    async fn increment(&self, key: &str, expire_seconds: u64, amount: i64) -> Result<(i64, u64)>;

    /// [`increment`](Self::increment) `key` and read `others` in one atomic step.
    ///
    /// Costs a single round trip on networked backends. `others` are returned
    /// as [`get_many`](Self::get_many) would.
    async fn increment_and_get(
        &self,
        key: &str,
        expire_seconds: u64,
        amount: i64,
        others: &[&str],
    ) -> Result<((i64, u64), HashMap<String, StoredValue>)>;

    /// Read a value and its remaining TTL.
    async fn get(&self, key: &str) -> Result<StoredValue>;

    /// Overwrite a value and (re)set its expiry.
    async fn set(&self, key: &str, value: f64, expire_seconds: u64) -> Result<bool>;

    /// Delete a key. Returns whether it existed.
    async fn reset(&self, key: &str) -> Result<bool>;

    /// Read several keys from one consistent view. Absent keys map to
    /// [`StoredValue::missing`].
    async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, StoredValue>>;

    /// Write several keys as a unit, all with the same expiry.
    ///
    /// Nothing is written (and `false` is returned) if any guard key no longer
    /// holds its expected value. An empty `preconditions` slice writes
    /// unconditionally.
    async fn set_many(
        &self,
        values: &[(String, f64)],
        expire_seconds: u64,
        preconditions: &[Precondition],
    ) -> Result<bool>;

    /// Release resources. Later calls may fail.
    async fn close(&self) -> Result<()>;

    /// Backend name used in logs and metrics.
    fn name(&self) -> &'static str;
}

/// Shared storage handle.
pub type SharedStorage = Arc<dyn StorageBackend>;

/// Two stored floats are the same value for compare-and-set purposes.
pub(crate) fn same_value(current: Option<f64>, expected: Option<f64>) -> bool {
    match (current, expected) {
        (None, None) => true,
        (Some(a), Some(b)) => (a - b).abs() < 1e-9,
        _ => false,
    }
}
