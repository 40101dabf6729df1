#![allow(clippy::result_large_err)]
//! # Limiter Core
//!
//! Multi-strategy rate limiting for axum/tower services.
//!
//! ## Architecture
//!
//! - **Storage**: atomic counters in process memory or Redis, behind one async trait
//! - **Strategies**: fixed window, sliding window and token bucket
//! - **Manager**: validates configuration, builds and caches storage and strategy
//! - **Middleware**: exemptions, key generation, tenant overrides and the tower gate
//! - **Collector**: rolling-window request statistics for the admin endpoints
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod admin;
pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod manager;
pub mod middleware;
pub mod storage;
pub mod strategy;
pub mod telemetry;

pub use error::{RateLimitError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::collector::{MetricsCollector, MetricsSnapshot};
    pub use crate::config::{RateLimitConfig, RedisSettings, StorageType, TenantLimits};
    pub use crate::error::{RateLimitError, Result};
    pub use crate::manager::RateLimitManager;
    pub use crate::middleware::{
        Outcome, RateLimitLayer, RateLimitService, RateLimiter, RequestInfo, TenantResolver,
    };
    pub use crate::storage::{MemoryStorage, RedisStorage, StorageBackend};
    pub use crate::strategy::{RateLimitDecision, RateLimitStrategy, StrategyKind, StrategySpec};
}
