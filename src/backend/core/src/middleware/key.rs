//! Limiter key generation.
//!
//! A key joins the enabled components (client IP, path, method) with `:`.
//! Keys longer than the configured maximum keep a readable prefix and replace
//! the rest with a SHA-256 digest of the whole key.

use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv6Addr};

use super::RequestInfo;
use crate::config::RateLimitConfig;

/// Separator between key components.
const DELIMITER: char = ':';

/// Hex-encoded SHA-256 length.
const DIGEST_LEN: usize = 64;

/// Key used when no component is enabled.
const GLOBAL_KEY: &str = "global";

/// Key component when no client address can be determined.
const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone)]
pub struct KeyGenerator {
    key_by_ip: bool,
    key_by_path: bool,
    key_by_method: bool,
    max_key_length: usize,
    trusted_proxy_headers: Vec<String>,
}

impl KeyGenerator {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            key_by_ip: config.key_by_ip,
            key_by_path: config.key_by_path,
            key_by_method: config.key_by_method,
            max_key_length: config.max_key_length,
            trusted_proxy_headers: config.trusted_proxy_headers.clone(),
        }
    }

    /// Client IP from trusted proxy headers, else the socket address.
    pub fn client_ip(&self, info: &RequestInfo) -> Option<IpAddr> {
        for header in &self.trusted_proxy_headers {
            if let Some(value) = info.header(header) {
                // X-Forwarded-For can contain multiple IPs, take the first (client)
                let candidate = value.split(',').next().unwrap_or(value).trim();
                if let Ok(ip) = candidate.parse() {
                    return Some(ip);
                }
            }
        }
        info.client_addr.map(|addr| addr.ip())
    }

    /// Key for `info`, already shortened to the maximum length.
    pub fn generate(&self, info: &RequestInfo) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(3);

        if self.key_by_ip {
            let ip = self
                .client_ip(info)
                .map(normalize_ip)
                .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
            parts.push(ip);
        }
        if self.key_by_path {
            parts.push(info.path.clone());
        }
        if self.key_by_method {
            parts.push(info.method.as_str().to_string());
        }

        if parts.is_empty() {
            return GLOBAL_KEY.to_string();
        }
        self.fit(&parts.join(&DELIMITER.to_string()))
    }

    /// Shorten `raw` to the maximum key length.
    pub fn fit(&self, raw: &str) -> String {
        hash_key(raw, self.max_key_length)
    }
}

/// Address form used in keys. IPv6 clients are grouped by their /64 network
/// since one host typically controls the whole prefix.
pub fn normalize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => {
                let s = v6.segments();
                let network = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
                format!("{}/64", network)
            }
        },
    }
}

/// `raw` unchanged when it fits in `max_len`, otherwise a readable prefix,
/// `:`, and the hex SHA-256 of `raw`. Never longer than `max_len`.
pub fn hash_key(raw: &str, max_len: usize) -> String {
    if raw.len() <= max_len {
        return raw.to_string();
    }

    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    if max_len <= DIGEST_LEN + 1 {
        return digest[..max_len.min(DIGEST_LEN)].to_string();
    }

    let mut prefix_len = max_len - DIGEST_LEN - 1;
    while !raw.is_char_boundary(prefix_len) {
        prefix_len -= 1;
    }
    format!("{}{}{}", &raw[..prefix_len], DELIMITER, digest)
}
