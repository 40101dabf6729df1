//! Resolves a [`RateLimitConfig`] into a concrete storage backend and strategy.
//!
//! Both are built lazily on first use and cached for the manager's lifetime.
//! Replacing the configuration through [`RateLimitManager::update_config`]
//! closes the old storage and drops both caches.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::{RateLimitConfig, StorageType, TenantLimits};
use crate::error::Result;
use crate::storage::{MemoryStorage, RedisStorage, SharedStorage, StorageBackend};
use crate::strategy::{SharedStrategy, StrategySpec};

#[derive(Debug, Clone)]
struct Resolved {
    config: Arc<RateLimitConfig>,
    spec: StrategySpec,
}

impl Resolved {
    fn from_config(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let spec = StrategySpec::resolve(config.strategy, &config.default_limits());
        Ok(Self {
            config: Arc::new(config),
            spec,
        })
    }
}

/// Owner of the limiter's storage and default strategy.
pub struct RateLimitManager {
    resolved: RwLock<Resolved>,
    storage: RwLock<Option<SharedStorage>>,
    strategy: RwLock<Option<SharedStrategy>>,
    /// Serializes building and replacing storage
    build_lock: Mutex<()>,
    clock: SharedClock,
}

impl std::fmt::Debug for RateLimitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resolved = self.resolved.read();
        f.debug_struct("RateLimitManager")
            .field("spec", &resolved.spec)
            .field("storage", &resolved.config.storage)
            .field("storage_ready", &self.storage.read().is_some())
            .finish()
    }
}

impl RateLimitManager {
    /// Validate `config` and resolve its strategy. Nothing is connected yet.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RateLimitConfig, clock: SharedClock) -> Result<Self> {
        let resolved = Resolved::from_config(config)?;
        info!(
            strategy = %resolved.spec.kind(),
            storage = %resolved.config.storage,
            rate_limit = resolved.config.rate_limit,
            period_seconds = resolved.config.period_seconds,
            "Rate limit manager configured"
        );
        Ok(Self {
            resolved: RwLock::new(resolved),
            storage: RwLock::new(None),
            strategy: RwLock::new(None),
            build_lock: Mutex::new(()),
            clock,
        })
    }

    /// Use `storage` instead of building one from the configuration.
    pub fn with_storage(self, storage: SharedStorage) -> Self {
        *self.storage.write() = Some(storage);
        self
    }

    /// Current configuration.
    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.resolved.read().config.clone()
    }

    /// Resolved default strategy.
    pub fn spec(&self) -> StrategySpec {
        self.resolved.read().spec
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// The cached storage backend, built on first call.
    pub async fn storage(&self) -> Result<SharedStorage> {
        if let Some(storage) = self.storage.read().clone() {
            return Ok(storage);
        }

        let _guard = self.build_lock.lock().await;
        if let Some(storage) = self.storage.read().clone() {
            return Ok(storage);
        }

        let storage = self.create_storage().await?;
        *self.storage.write() = Some(storage.clone());
        Ok(storage)
    }

    /// The cached default strategy, built on first call.
    pub async fn strategy(&self) -> Result<SharedStrategy> {
        if let Some(strategy) = self.strategy.read().clone() {
            return Ok(strategy);
        }

        let storage = self.storage().await?;
        let (spec, namespace) = {
            let resolved = self.resolved.read();
            (resolved.spec, resolved.config.namespace.clone())
        };

        let mut slot = self.strategy.write();
        let strategy = slot
            .get_or_insert_with(|| spec.build(storage, namespace, self.clock.clone()))
            .clone();
        Ok(strategy)
    }

    /// Build a strategy of the configured kind with `limits` overriding the
    /// defaults, keys scoped by `namespace`, sharing `storage`.
    pub fn create_strategy(
        &self,
        storage: SharedStorage,
        namespace: &str,
        limits: &TenantLimits,
    ) -> SharedStrategy {
        let config = self.config();
        let params = limits.merged_with(&config.default_limits());
        StrategySpec::resolve(config.strategy, &params).build(
            storage,
            namespace,
            self.clock.clone(),
        )
    }

    /// Build a fresh storage backend of the configured type.
    pub async fn create_storage(&self) -> Result<SharedStorage> {
        let config = self.config();
        match config.storage {
            StorageType::Memory => {
                let storage = Arc::new(MemoryStorage::with_clock(self.clock.clone()));
                if tokio::runtime::Handle::try_current().is_ok() {
                    storage.spawn_sweeper(config.sweep_interval);
                }
                Ok(storage)
            }
            StorageType::Networked => {
                let storage = RedisStorage::connect(&config.redis).await?;
                Ok(Arc::new(storage))
            }
        }
    }

    /// Replace the configuration. The old storage is closed and both caches
    /// are dropped; the next request rebuilds them.
    pub async fn update_config(&self, config: RateLimitConfig) -> Result<()> {
        let resolved = Resolved::from_config(config)?;

        let _guard = self.build_lock.lock().await;
        info!(
            strategy = %resolved.spec.kind(),
            storage = %resolved.config.storage,
            "Rate limit configuration replaced"
        );
        *self.resolved.write() = resolved;
        self.strategy.write().take();
        let previous = self.storage.write().take();

        if let Some(storage) = previous {
            if let Err(err) = storage.close().await {
                warn!(backend = storage.name(), error = %err, "Failed to close replaced storage");
            }
        }
        Ok(())
    }

    /// Close the storage backend. Later calls rebuild it.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.build_lock.lock().await;
        self.strategy.write().take();
        let storage = self.storage.write().take();
        if let Some(storage) = storage {
            storage.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::RateLimitError;
    use crate::strategy::StrategyKind;

    fn manager(config: RateLimitConfig) -> RateLimitManager {
        RateLimitManager::with_clock(config, Arc::new(ManualClock::new(6000.0))).unwrap()
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let err = RateLimitManager::new(RateLimitConfig::builder().period_seconds(0).build())
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_storage_and_strategy_cached() {
        let manager = manager(RateLimitConfig::default());

        let first = manager.storage().await.unwrap();
        let second = manager.storage().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let a = manager.strategy().await.unwrap();
        let b = manager.strategy().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.kind(), StrategyKind::FixedWindow);
        assert_eq!(a.namespace(), "ratelimit");
    }

    #[tokio::test]
    async fn test_token_bucket_capacity_threaded_through() {
        let manager = manager(
            RateLimitConfig::builder()
                .strategy(StrategyKind::TokenBucket)
                .rate_limit(60)
                .bucket_capacity(15)
                .build(),
        );
        let strategy = manager.strategy().await.unwrap();
        assert_eq!(strategy.kind(), StrategyKind::TokenBucket);
        assert_eq!(strategy.limit(), 15);
    }

    #[tokio::test]
    async fn test_create_strategy_applies_overrides() {
        let manager = manager(RateLimitConfig::builder().rate_limit(100).build());
        let storage = manager.storage().await.unwrap();

        let limits = TenantLimits {
            rate_limit: Some(3),
            ..Default::default()
        };
        let strategy = manager.create_strategy(storage, "ratelimit:acme", &limits);
        assert_eq!(strategy.limit(), 3);
        assert_eq!(strategy.namespace(), "ratelimit:acme");
    }

    #[tokio::test]
    async fn test_update_config_invalidates_caches() {
        let manager = manager(RateLimitConfig::default());
        let old_storage = manager.storage().await.unwrap();
        let old_strategy = manager.strategy().await.unwrap();
        old_strategy.increment("client").await.unwrap();

        manager
            .update_config(
                RateLimitConfig::builder()
                    .strategy(StrategyKind::SlidingWindow)
                    .build(),
            )
            .await
            .unwrap();

        // Old storage was closed
        assert!(old_storage.get("anything").await.is_err());

        let new_strategy = manager.strategy().await.unwrap();
        assert!(!Arc::ptr_eq(&old_strategy, &new_strategy));
        assert_eq!(new_strategy.kind(), StrategyKind::SlidingWindow);
        assert_eq!(manager.config().strategy, StrategyKind::SlidingWindow);
    }

    #[tokio::test]
    async fn test_update_with_invalid_config_keeps_current() {
        let manager = manager(RateLimitConfig::default());
        let result = manager
            .update_config(RateLimitConfig::builder().rate_limit(0).build())
            .await;
        assert!(result.is_err());
        assert_eq!(manager.config().rate_limit, 100);
    }
}
