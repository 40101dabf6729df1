//! HTTP gate for the rate limiter.
//!
//! - `key`: limiter key generation and client IP extraction
//! - `exemption`: path and IP rules that bypass limiting
//! - `tenant`: tenant identification and per-tenant limits
//! - `rate_limit`: the [`RateLimiter`] gate and its tower layer

pub mod exemption;
pub mod key;
pub mod rate_limit;
pub mod tenant;

pub use exemption::ExemptionRules;
pub use key::KeyGenerator;
pub use rate_limit::{
    BypassReason, ExemptionFn, KeyFn, Outcome, RateLimitLayer, RateLimitService, RateLimiter,
};
pub use tenant::{TenantResolver, DEFAULT_TENANT};

use axum::{
    extract::{ConnectInfo, Query, RawPathParams, Request},
    http::{HeaderMap, Method},
};
use axum::extract::FromRequestParts;
use std::collections::HashMap;
use std::net::SocketAddr;

/// The parts of an HTTP request the limiter looks at.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub path_params: HashMap<String, String>,
    pub client_addr: Option<SocketAddr>,
}

impl RequestInfo {
    /// Collect request details, handing the request back untouched.
    ///
    /// Path parameters are only available once the router has matched, that
    /// is when the layer is installed with `Router::route_layer`/`layer`.
    pub async fn extract(request: Request) -> (Self, Request) {
        let (mut parts, body) = request.into_parts();

        let path_params = RawPathParams::from_request_parts(&mut parts, &())
            .await
            .map(|params| {
                params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();

        let info = Self {
            path: parts.uri.path().to_string(),
            method: parts.method.clone(),
            headers: parts.headers.clone(),
            query,
            path_params,
            client_addr: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0),
        };

        (info, Request::from_parts(parts, body))
    }

    /// First value of a header as trimmed, non-empty text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}
