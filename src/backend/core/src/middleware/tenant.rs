//! Tenant identification and per-tenant limit overrides.

use parking_lot::RwLock;
use std::collections::HashMap;

use super::RequestInfo;
use crate::config::{LimitParams, RateLimitConfig, TenantLimits};
use crate::error::{RateLimitError, Result};

/// Tenant used when a request carries no tenant identifier.
pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug)]
pub struct TenantResolver {
    header: String,
    query_param: String,
    path_param: String,
    defaults: LimitParams,
    overrides: RwLock<HashMap<String, TenantLimits>>,
}

impl TenantResolver {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            header: config.tenant_header.clone(),
            query_param: config.tenant_query_param.clone(),
            path_param: config.tenant_path_param.clone(),
            defaults: config.default_limits(),
            overrides: RwLock::new(config.tenant_limits.clone()),
        }
    }

    /// Tenant from the header, then the query string, then the path.
    pub fn extract_tenant_id(&self, info: &RequestInfo) -> String {
        if let Some(id) = info.header(&self.header) {
            return id.to_string();
        }

        let from_params = |params: &HashMap<String, String>, name: &str| {
            params
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        from_params(&info.query, &self.query_param)
            .or_else(|| from_params(&info.path_params, &self.path_param))
            .unwrap_or_else(|| DEFAULT_TENANT.to_string())
    }

    /// Limits for `tenant_id`, with absent fields taken from the global defaults.
    pub fn tenant_limits(&self, tenant_id: &str) -> TenantLimits {
        let params = self
            .overrides
            .read()
            .get(tenant_id)
            .map(|limits| limits.merged_with(&self.defaults))
            .unwrap_or(self.defaults);

        TenantLimits {
            rate_limit: Some(params.rate_limit),
            period_seconds: Some(params.period_seconds),
            bucket_capacity: params.bucket_capacity,
        }
    }

    pub fn has_override(&self, tenant_id: &str) -> bool {
        self.overrides.read().contains_key(tenant_id)
    }

    /// Register or replace an override. Takes effect on the next request.
    pub fn set_tenant_limits(&self, tenant_id: impl Into<String>, limits: TenantLimits) -> Result<()> {
        let tenant_id = tenant_id.into();
        if tenant_id.is_empty() {
            return Err(RateLimitError::configuration("tenant id must not be empty"));
        }
        if [limits.rate_limit, limits.period_seconds, limits.bucket_capacity].contains(&Some(0)) {
            return Err(RateLimitError::configuration(format!(
                "tenant '{}': limits must be greater than 0",
                tenant_id
            )));
        }
        self.overrides.write().insert(tenant_id, limits);
        Ok(())
    }

    /// Drop an override. Returns whether one existed.
    pub fn remove_tenant_limits(&self, tenant_id: &str) -> bool {
        self.overrides.write().remove(tenant_id).is_some()
    }
}
