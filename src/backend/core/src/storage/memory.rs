//! In-process storage backend.

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{same_value, Precondition, StorageBackend, StoredValue};
use crate::clock::{system_clock, SharedClock};
use crate::error::{RateLimitError, Result};

/// Keys examined per lock acquisition while sweeping.
const SWEEP_BATCH: usize = 512;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: f64,
    /// Absolute expiry in clock seconds
    expires_at: Option<f64>,
}

impl Entry {
    fn is_expired(&self, now: f64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn ttl(&self, now: f64) -> Option<u64> {
        self.expires_at
            .map(|at| (at - now).max(0.0).ceil() as u64)
    }
}

/// Storage backed by a single locked map.
///
/// All operations on the table run under one mutex so multi-key reads and
/// writes are mutually atomic. Expired entries are dropped lazily on access and
/// in bulk by [`MemoryStorage::sweep_expired`].
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Entry>>,
    clock: SharedClock,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.entries.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry. Returns how many were removed.
    ///
    /// Works in batches, releasing the lock between them so request traffic is
    /// never blocked behind a full scan.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        loop {
            let now = self.clock.now();
            let mut entries = self.entries.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .take(SWEEP_BATCH)
                .map(|(key, _)| key.clone())
                .collect();

            for key in &expired {
                entries.remove(key);
            }
            drop(entries);

            removed += expired.len();
            if expired.len() < SWEEP_BATCH {
                break;
            }
        }

        if removed > 0 {
            debug!(removed, "Swept expired rate limit entries");
        }
        removed
    }

    /// Start the background sweep task on the current runtime.
    ///
    /// Replaces any sweeper already running. The task holds only a weak
    /// reference and exits once the store is dropped or closed.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(storage) = weak.upgrade() else {
                    break;
                };
                if storage.closed.load(Ordering::Acquire) {
                    break;
                }
                storage.sweep_expired();
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Memory storage sweeper started");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RateLimitError::storage("storage closed"));
        }
        Ok(())
    }

    fn expiry(&self, now: f64, expire_seconds: u64) -> Option<f64> {
        (expire_seconds > 0).then(|| now + expire_seconds as f64)
    }

    /// Live entry for `key`, evicting it if expired.
    fn live(entries: &mut HashMap<String, Entry>, key: &str, now: f64) -> Option<Entry> {
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(*entry),
            None => None,
        }
    }

    /// Add `amount` to `key`, creating it with `expires_at` when absent.
    fn bump(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        now: f64,
        expires_at: Option<f64>,
        amount: i64,
    ) -> Entry {
        let entry = match Self::live(entries, key, now) {
            Some(mut existing) => {
                existing.value += amount as f64;
                existing
            }
            None => Entry {
                value: amount as f64,
                expires_at,
            },
        };
        entries.insert(key.to_string(), entry);
        entry
    }

    fn read(entries: &mut HashMap<String, Entry>, key: &str, now: f64) -> StoredValue {
        match Self::live(entries, key, now) {
            Some(entry) => StoredValue {
                value: Some(entry.value),
                ttl: entry.ttl(now),
            },
            None => StoredValue::missing(),
        }
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn increment(&self, key: &str, expire_seconds: u64, amount: i64) -> Result<(i64, u64)> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let entry = Self::bump(&mut entries, key, now, self.expiry(now, expire_seconds), amount);
        drop(entries);

        counter!("rate_limit_storage_ops_total", "backend" => "memory", "op" => "increment")
            .increment(1);
        Ok((entry.value.round() as i64, entry.ttl(now).unwrap_or(0)))
    }

    async fn increment_and_get(
        &self,
        key: &str,
        expire_seconds: u64,
        amount: i64,
        others: &[&str],
    ) -> Result<((i64, u64), HashMap<String, StoredValue>)> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let entry = Self::bump(&mut entries, key, now, self.expiry(now, expire_seconds), amount);
        let values = others
            .iter()
            .map(|other| (other.to_string(), Self::read(&mut entries, other, now)))
            .collect();
        drop(entries);

        counter!("rate_limit_storage_ops_total", "backend" => "memory", "op" => "increment_and_get")
            .increment(1);
        Ok(((entry.value.round() as i64, entry.ttl(now).unwrap_or(0)), values))
    }

    async fn get(&self, key: &str) -> Result<StoredValue> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        Ok(Self::read(&mut entries, key, now))
    }

    async fn set(&self, key: &str, value: f64, expire_seconds: u64) -> Result<bool> {
        self.ensure_open()?;
        let now = self.clock.now();
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: self.expiry(now, expire_seconds),
            },
        );
        counter!("rate_limit_storage_ops_total", "backend" => "memory", "op" => "set")
            .increment(1);
        Ok(true)
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let now = self.clock.now();
        let removed = self.entries.lock().remove(key);
        Ok(matches!(removed, Some(entry) if !entry.is_expired(now)))
    }

    async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, StoredValue>> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let values = keys
            .iter()
            .map(|key| (key.to_string(), Self::read(&mut entries, key, now)))
            .collect();
        Ok(values)
    }

    async fn set_many(
        &self,
        values: &[(String, f64)],
        expire_seconds: u64,
        preconditions: &[Precondition],
    ) -> Result<bool> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        for guard in preconditions {
            let current = Self::live(&mut entries, &guard.key, now).map(|e| e.value);
            if !same_value(current, guard.expected) {
                counter!("rate_limit_storage_ops_total", "backend" => "memory", "op" => "cas_conflict")
                    .increment(1);
                return Ok(false);
            }
        }

        let expires_at = self.expiry(now, expire_seconds);
        for (key, value) in values {
            entries.insert(
                key.clone(),
                Entry {
                    value: *value,
                    expires_at,
                },
            );
        }
        counter!("rate_limit_storage_ops_total", "backend" => "memory", "op" => "set_many")
            .increment(1);
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.entries.lock().clear();
        debug!("Memory storage closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
