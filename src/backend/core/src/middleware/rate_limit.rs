//! Rate limiting gate and its tower middleware.
//!
//! Per request:
//! 1. Pass through when limiting is disabled
//! 2. Pass through exempted paths and client IPs
//! 3. Build the limiter key (custom key function or IP/path/method)
//! 4. Pick the default strategy, or a tenant-scoped one when tenant limits are on
//! 5. Consume one unit and record the decision
//! 6. Reject with 429, or forward and annotate the response with X-RateLimit-* headers
//!
//! Storage and strategy faults fail open unless `block_on_failure` is set.
//!
//! # Example
//!
//! ```rust,ignore
//! use limiter_core::{RateLimitConfig, RateLimitLayer};
//!
//! let config = RateLimitConfig::builder()
//!     .rate_limit(100)
//!     .period_seconds(60)
//!     .build();
//!
//! let app = Router::new()
//!     .route("/api/v1/items", get(list_items))
//!     .layer(RateLimitLayer::from_config(config)?);
//! ```

use axum::{
    body::Body,
    extract::Request,
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::{ExemptionRules, KeyGenerator, RequestInfo, TenantResolver};
use crate::collector::{MetricsCollector, MetricsSnapshot};
use crate::config::RateLimitConfig;
use crate::error::{RateLimitError, Result};
use crate::manager::RateLimitManager;
use crate::strategy::{RateLimitDecision, SharedStrategy};

/// Custom key function. `None` falls back to the configured key components.
pub type KeyFn = Arc<dyn Fn(&RequestInfo) -> Option<String> + Send + Sync>;

/// Custom exemption function. Returning `true` bypasses limiting.
pub type ExemptionFn = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// Outcome
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Disabled,
    Exempt,
}

/// Result of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not counted against any key
    Bypass(BypassReason),
    Decision {
        decision: RateLimitDecision,
        key: String,
        tenant: Option<String>,
    },
}

impl Outcome {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        match self {
            Self::Bypass(_) => true,
            Self::Decision { decision, .. } => decision.allowed,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate Limiter
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct HeaderNames {
    limit: HeaderName,
    remaining: HeaderName,
    reset: HeaderName,
}

impl HeaderNames {
    fn with_prefix(prefix: &str) -> Result<Self> {
        let name = |suffix: &str| {
            HeaderName::from_bytes(format!("{}-{}", prefix, suffix).as_bytes()).map_err(|e| {
                RateLimitError::configuration(format!("invalid header prefix '{}': {}", prefix, e))
            })
        };
        Ok(Self {
            limit: name("Limit")?,
            remaining: name("Remaining")?,
            reset: name("Reset")?,
        })
    }
}

/// Everything derived from one configuration, swapped as a unit.
#[derive(Debug)]
struct Rules {
    config: Arc<RateLimitConfig>,
    exemptions: ExemptionRules,
    keys: KeyGenerator,
    tenants: Arc<TenantResolver>,
    headers: HeaderNames,
}

impl Rules {
    fn build(config: Arc<RateLimitConfig>) -> Result<Self> {
        Ok(Self {
            exemptions: ExemptionRules::new(&config.exempted_paths, &config.exempted_ips)?,
            keys: KeyGenerator::from_config(&config),
            tenants: Arc::new(TenantResolver::from_config(&config)),
            headers: HeaderNames::with_prefix(&config.header_prefix)?,
            config,
        })
    }
}

/// The rate limiting gate.
pub struct RateLimiter {
    manager: Arc<RateLimitManager>,
    rules: RwLock<Arc<Rules>>,
    metrics: MetricsCollector,
    key_fn: Option<KeyFn>,
    exemption_fn: Option<ExemptionFn>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("manager", &self.manager)
            .field("custom_key_fn", &self.key_fn.is_some())
            .field("custom_exemption_fn", &self.exemption_fn.is_some())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(manager: Arc<RateLimitManager>) -> Result<Self> {
        let config = manager.config();
        let metrics = MetricsCollector::new(config.metrics_window_seconds, manager.clock());
        let rules = Rules::build(config)?;
        Ok(Self {
            manager,
            rules: RwLock::new(Arc::new(rules)),
            metrics,
            key_fn: None,
            exemption_fn: None,
        })
    }

    pub fn from_config(config: RateLimitConfig) -> Result<Self> {
        Self::new(Arc::new(RateLimitManager::new(config)?))
    }

    /// Derive keys with `f`, falling back to the configured components when it returns `None`.
    pub fn with_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestInfo) -> Option<String> + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Exempt every request for which `f` returns `true`.
    pub fn with_exemption_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        self.exemption_fn = Some(Arc::new(f));
        self
    }

    fn rules(&self) -> Arc<Rules> {
        self.rules.read().clone()
    }

    pub fn manager(&self) -> &Arc<RateLimitManager> {
        &self.manager
    }

    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.rules().config.clone()
    }

    /// Tenant resolver for the current configuration. Replaced by `update_config`.
    pub fn tenants(&self) -> Arc<TenantResolver> {
        self.rules().tenants.clone()
    }

    /// Replace the configuration. Rules are compiled before anything is swapped,
    /// so an invalid configuration leaves the limiter untouched.
    pub async fn update_config(&self, config: RateLimitConfig) -> Result<()> {
        config.validate()?;
        let rules = Rules::build(Arc::new(config.clone()))?;
        self.manager.update_config(config).await?;
        *self.rules.write() = Arc::new(rules);
        Ok(())
    }

    fn is_exempt(&self, rules: &Rules, info: &RequestInfo) -> bool {
        if let Some(ref exempt) = self.exemption_fn {
            if exempt(info) {
                return true;
            }
        }
        if rules.exemptions.is_path_exempt(&info.path) {
            return true;
        }
        rules
            .keys
            .client_ip(info)
            .map(|ip| rules.exemptions.is_ip_exempt(ip))
            .unwrap_or(false)
    }

    fn key_for(&self, rules: &Rules, info: &RequestInfo) -> String {
        self.key_fn
            .as_ref()
            .and_then(|f| f(info))
            .map(|key| rules.keys.fit(&key))
            .unwrap_or_else(|| rules.keys.generate(info))
    }

    /// Default strategy, or one scoped to `tenant` with its overrides applied.
    async fn strategy_for(&self, rules: &Rules, tenant: Option<&str>) -> Result<SharedStrategy> {
        match tenant {
            Some(tenant) => {
                let storage = self.manager.storage().await?;
                let namespace = format!("{}:{}", rules.config.namespace, tenant);
                let limits = rules.tenants.tenant_limits(tenant);
                Ok(self.manager.create_strategy(storage, &namespace, &limits))
            }
            None => self.manager.strategy().await,
        }
    }

    /// Decide whether `info` may proceed, consuming one unit when it is limited.
    pub async fn evaluate(&self, info: &RequestInfo) -> Result<Outcome> {
        let rules = self.rules();
        if !rules.config.enabled {
            return Ok(Outcome::Bypass(BypassReason::Disabled));
        }

        if self.is_exempt(&rules, info) {
            counter!("rate_limit_exempted_total").increment(1);
            debug!(path = %info.path, "Request exempt from rate limiting");
            return Ok(Outcome::Bypass(BypassReason::Exempt));
        }

        let started = Instant::now();
        let key = self.key_for(&rules, info);
        let tenant = rules
            .config
            .enable_tenant_limits
            .then(|| rules.tenants.extract_tenant_id(info));

        let strategy = self.strategy_for(&rules, tenant.as_deref()).await?;
        let decision = strategy.increment(&key).await?;
        let kind = strategy.kind().as_str();

        histogram!("rate_limit_decision_duration_seconds").record(started.elapsed().as_secs_f64());
        counter!(
            "rate_limit_requests_total",
            "strategy" => kind,
            "allowed" => if decision.allowed { "true" } else { "false" }
        )
        .increment(1);
        self.metrics
            .record_request(decision.allowed, &key, kind, &info.path);

        debug!(
            key = %key,
            tenant = tenant.as_deref().unwrap_or("-"),
            strategy = kind,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Rate limit decision"
        );

        Ok(Outcome::Decision {
            decision,
            key,
            tenant,
        })
    }

    /// Read-only view of `identifier`'s state.
    pub async fn check_identifier(
        &self,
        identifier: &str,
        tenant: Option<&str>,
    ) -> Result<RateLimitDecision> {
        let rules = self.rules();
        let strategy = self.strategy_for(&rules, tenant).await?;
        strategy.check(&rules.keys.fit(identifier)).await
    }

    /// Clear `identifier`'s state. Returns whether anything was removed.
    pub async fn reset_identifier(&self, identifier: &str, tenant: Option<&str>) -> Result<bool> {
        let rules = self.rules();
        let strategy = self.strategy_for(&rules, tenant).await?;
        strategy.reset(&rules.keys.fit(identifier)).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// The 429 for a denied `decision`, headers included only when enabled.
    fn rejection(&self, decision: &RateLimitDecision) -> Response {
        let mut response = decision.into_exceeded().into_response();
        if self.rules().config.include_headers {
            self.apply_headers(response.headers_mut(), decision);
        } else {
            response.headers_mut().remove(RETRY_AFTER);
        }
        response
    }

    /// Attach the rate limit headers for `decision`. No-op when disabled.
    fn apply_headers(&self, headers: &mut HeaderMap, decision: &RateLimitDecision) {
        let rules = self.rules();
        if !rules.config.include_headers {
            return;
        }
        headers.insert(rules.headers.limit.clone(), HeaderValue::from(decision.limit));
        headers.insert(
            rules.headers.remaining.clone(),
            HeaderValue::from(decision.remaining),
        );
        headers.insert(
            rules.headers.reset.clone(),
            HeaderValue::from(decision.reset_seconds),
        );
        if let Some(retry_after) = decision.retry_after_seconds {
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }

    fn fails_open(&self, err: &RateLimitError) -> bool {
        err.is_recoverable() && !self.rules().config.block_on_failure
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limiting layer for Tower.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    /// Create from configuration. Storage connects on the first request.
    pub fn from_config(config: RateLimitConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(RateLimiter::from_config(config)?)))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (info, request) = RequestInfo::extract(request).await;

            match limiter.evaluate(&info).await {
                Ok(Outcome::Bypass(_)) => inner.call(request).await,
                Ok(Outcome::Decision { decision, .. }) if decision.allowed => {
                    let mut response = inner.call(request).await?;
                    limiter.apply_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                Ok(Outcome::Decision { decision, key, .. }) => {
                    debug!(key = %key, path = %info.path, "Request rate limited");
                    Ok(limiter.rejection(&decision))
                }
                Err(err) if limiter.fails_open(&err) => {
                    warn!(
                        code = err.code(),
                        error = %err,
                        path = %info.path,
                        "Rate limiter unavailable, allowing request"
                    );
                    counter!("rate_limit_fail_open_total").increment(1);
                    inner.call(request).await
                }
                Err(err) => {
                    error!(code = err.code(), error = %err, path = %info.path, "Rate limiter failed, rejecting request");
                    Ok(err.into_response())
                }
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
