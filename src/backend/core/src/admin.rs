//! Introspection endpoints for the limiter.
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | GET | `/ratelimit/metrics` | rolling metrics snapshot |
//! | POST | `/ratelimit/metrics/reset` | 204 |
//! | GET | `/ratelimit/keys/:identifier` | current decision, nothing consumed |
//! | DELETE | `/ratelimit/keys/:identifier` | `{"reset": bool}` |
//!
//! The key endpoints accept `?tenant=<id>` to address a tenant-scoped counter.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::collector::MetricsSnapshot;
use crate::error::Result;
use crate::middleware::RateLimiter;
use crate::strategy::RateLimitDecision;

#[derive(Debug, Default, Deserialize)]
pub struct KeyQuery {
    pub tenant: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetResponse {
    pub reset: bool,
}

pub fn router(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/ratelimit/metrics", get(metrics_snapshot))
        .route("/ratelimit/metrics/reset", post(reset_metrics))
        .route(
            "/ratelimit/keys/:identifier",
            get(inspect_key).delete(reset_key),
        )
        .with_state(limiter)
}

async fn metrics_snapshot(State(limiter): State<Arc<RateLimiter>>) -> Json<MetricsSnapshot> {
    Json(limiter.metrics())
}

async fn reset_metrics(State(limiter): State<Arc<RateLimiter>>) -> StatusCode {
    limiter.reset_metrics();
    info!("Rate limit metrics reset");
    StatusCode::NO_CONTENT
}

async fn inspect_key(
    State(limiter): State<Arc<RateLimiter>>,
    Path(identifier): Path<String>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<RateLimitDecision>> {
    let decision = limiter
        .check_identifier(&identifier, query.tenant.as_deref())
        .await?;
    Ok(Json(decision))
}

async fn reset_key(
    State(limiter): State<Arc<RateLimiter>>,
    Path(identifier): Path<String>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<ResetResponse>> {
    let reset = limiter
        .reset_identifier(&identifier, query.tenant.as_deref())
        .await?;
    info!(identifier = %identifier, tenant = ?query.tenant, reset, "Rate limit key reset");
    Ok(Json(ResetResponse { reset }))
}
