//! Limiter Server - Main entry point
//!
//! Hosts the rate limiting middleware in front of a small demo API, with the
//! admin endpoints, Prometheus metrics and a health check alongside.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::header::CONTENT_TYPE,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::trace::TraceLayer;

use limiter_core::{
    admin,
    config::Config,
    middleware::{RateLimitLayer, RateLimiter},
    telemetry::{init_logging, init_metrics, MetricsRegistry},
};

/// Rate limiting server
#[derive(Debug, Parser)]
#[command(name = "limiter-server", version, about)]
struct Args {
    /// Configuration file (TOML, YAML or JSON), layered under LIMITER__* variables
    #[arg(short, long, env = "LIMITER_CONFIG")]
    config: Option<String>,

    /// Address to listen on, overrides server.host/server.port
    #[arg(short, long, env = "LIMITER_BIND")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Invalid configuration is a deployment fault, refuse to start
    let config = match args.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    init_logging(&config.logging, &config.environment)?;
    let registry = init_metrics(&config.metrics, "limiter-server")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Starting Limiter Server"
    );

    let limiter = Arc::new(RateLimiter::from_config(config.rate_limit.clone())?);
    let app = build_router(limiter.clone(), registry);

    let addr = match args.bind {
        Some(addr) => addr,
        None => format!("{}:{}", config.server.host, config.server.port).parse()?,
    };
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Cleanup
    if let Err(e) = limiter.manager().close().await {
        tracing::warn!(error = %e, "Failed to close rate limit storage");
    }
    tracing::info!("Server shutdown complete");

    Ok(())
}

fn build_router(limiter: Arc<RateLimiter>, registry: MetricsRegistry) -> Router {
    let api = Router::new()
        .route("/api/items", get(list_items))
        .route("/api/tenants/:tenant_id/items", get(list_tenant_items))
        .layer(RateLimitLayer::new(limiter.clone()));

    let ops = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(registry);

    Router::new()
        .merge(api)
        .merge(ops)
        .merge(admin::router(limiter))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(registry): State<MetricsRegistry>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        registry.render(),
    )
}

async fn list_items() -> impl IntoResponse {
    Json(json!({ "items": ["alpha", "beta", "gamma"] }))
}

async fn list_tenant_items(Path(tenant_id): Path<String>) -> impl IntoResponse {
    Json(json!({ "tenant": tenant_id, "items": ["alpha", "beta"] }))
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
