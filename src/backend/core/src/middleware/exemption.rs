//! Path and IP exemption rules.
//!
//! Path rules:
//! - `/health`: exact match
//! - `/api/*`: prefix match on everything before the trailing `*`
//! - `^/internal/.*$`: regular expression (any rule starting with `^`)
//!
//! IP rules are an exact address or a CIDR block (`10.0.0.0/8`, `2001:db8::/32`).

use regex::Regex;
use std::net::IpAddr;

use crate::error::{RateLimitError, Result};

#[derive(Debug, Clone)]
enum PathRule {
    Exact(String),
    Prefix(String),
    Pattern(Regex),
}

impl PathRule {
    fn parse(rule: &str) -> Result<Self> {
        if rule.starts_with('^') {
            let regex = Regex::new(rule).map_err(|e| {
                RateLimitError::configuration(format!("invalid path exemption '{}': {}", rule, e))
            })?;
            return Ok(Self::Pattern(regex));
        }
        match rule.strip_suffix('*') {
            Some(prefix) => Ok(Self::Prefix(prefix.to_string())),
            None => Ok(Self::Exact(rule.to_string())),
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => path == exact,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Pattern(regex) => regex.is_match(path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpRule {
    V4 { network: u32, mask: u32 },
    V6 { network: u128, mask: u128 },
}

impl IpRule {
    fn parse(rule: &str) -> Result<Self> {
        let invalid = || RateLimitError::configuration(format!("invalid IP exemption '{}'", rule));

        let (addr, prefix) = match rule.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u32>().map_err(|_| invalid())?)),
            None => (rule, None),
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;

        match addr {
            IpAddr::V4(v4) => {
                let bits = prefix.unwrap_or(32);
                if bits > 32 {
                    return Err(invalid());
                }
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                Ok(Self::V4 {
                    network: u32::from(v4) & mask,
                    mask,
                })
            }
            IpAddr::V6(v6) => {
                let bits = prefix.unwrap_or(128);
                if bits > 128 {
                    return Err(invalid());
                }
                let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
                Ok(Self::V6 {
                    network: u128::from(v6) & mask,
                    mask,
                })
            }
        }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            other => other,
        };
        match (self, ip) {
            (Self::V4 { network, mask }, IpAddr::V4(v4)) => u32::from(v4) & mask == *network,
            (Self::V6 { network, mask }, IpAddr::V6(v6)) => u128::from(v6) & mask == *network,
            _ => false,
        }
    }
}

/// Compiled exemption lists.
#[derive(Debug, Clone, Default)]
pub struct ExemptionRules {
    paths: Vec<PathRule>,
    ips: Vec<IpRule>,
}

impl ExemptionRules {
    /// Compile the rules. Invalid patterns or addresses are configuration errors.
    pub fn new(paths: &[String], ips: &[String]) -> Result<Self> {
        Ok(Self {
            paths: paths
                .iter()
                .map(|p| PathRule::parse(p))
                .collect::<Result<_>>()?,
            ips: ips.iter().map(|ip| IpRule::parse(ip)).collect::<Result<_>>()?,
        })
    }

    pub fn is_path_exempt(&self, path: &str) -> bool {
        self.paths.iter().any(|rule| rule.matches(path))
    }

    pub fn is_ip_exempt(&self, ip: IpAddr) -> bool {
        self.ips.iter().any(|rule| rule.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.ips.is_empty()
    }
}
