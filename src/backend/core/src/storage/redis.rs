//! Redis storage backend.

use async_trait::async_trait;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::{RedisError, RedisResult, Script, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{Precondition, RetryPolicy, StorageBackend, StoredValue};
use crate::config::RedisSettings;
use crate::error::{RateLimitError, Result};

/// INCRBY with expiry on first creation only.
///
/// KEYS[1] counter, ARGV[1] expire seconds, ARGV[2] amount.
/// Returns `{value, ttl}`.
const INCREMENT_SCRIPT: &str = r#"
local value = redis.call('INCRBY', KEYS[1], ARGV[2])
local ttl = redis.call('TTL', KEYS[1])
local expire = tonumber(ARGV[1])
if ttl < 0 then
    if expire > 0 then
        redis.call('EXPIRE', KEYS[1], expire)
        ttl = expire
    else
        ttl = 0
    end
end
return {value, ttl}
"#;

/// INCRBY as in `INCREMENT_SCRIPT`, then GET and TTL of every other key.
///
/// KEYS[1] counter, KEYS[2..] keys to read, ARGV as in `INCREMENT_SCRIPT`.
/// Returns `{value, ttl, v2, ttl2, v3, ttl3, ...}`.
const INCREMENT_AND_GET_SCRIPT: &str = r#"
local value = redis.call('INCRBY', KEYS[1], ARGV[2])
local ttl = redis.call('TTL', KEYS[1])
local expire = tonumber(ARGV[1])
if ttl < 0 then
    if expire > 0 then
        redis.call('EXPIRE', KEYS[1], expire)
        ttl = expire
    else
        ttl = 0
    end
end
local reply = {value, ttl}
for i = 2, #KEYS do
    table.insert(reply, redis.call('GET', KEYS[i]))
    table.insert(reply, redis.call('TTL', KEYS[i]))
end
return reply
"#;

/// Guarded multi-key SET.
///
/// KEYS[1..g] guards, KEYS[g+1..] targets. ARGV[1] expire seconds, ARGV[2] the
/// guard count g. For every key, ARGV[2 + i] pairs with KEYS[i]: the expected
/// value (empty string for absent) for a guard, the new value for a target.
/// Returns 1 when written, 0 when a guard did not match.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local expire = tonumber(ARGV[1])
local guards = tonumber(ARGV[2])
for i = 1, guards do
    local current = redis.call('GET', KEYS[i])
    local expected = ARGV[2 + i]
    if expected == '' then
        if current then
            return 0
        end
    elseif not current or math.abs(tonumber(current) - tonumber(expected)) > 1e-9 then
        return 0
    end
end
for i = guards + 1, #KEYS do
    if expire > 0 then
        redis.call('SET', KEYS[i], ARGV[2 + i], 'EX', expire)
    else
        redis.call('SET', KEYS[i], ARGV[2 + i])
    end
end
return 1
"#;

/// Failure of a single command attempt, before conversion.
#[derive(Debug, Error)]
enum CommandError {
    #[error("{0}")]
    Redis(#[from] RedisError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl CommandError {
    /// Only transport failures are retried; a timed out command may already
    /// have been applied.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Redis(err) => {
                err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
            }
            Self::Timeout(_) => false,
        }
    }
}

impl From<CommandError> for RateLimitError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Redis(err) => RateLimitError::from(err),
            CommandError::Timeout(after) => RateLimitError::StorageTimeout(after),
        }
    }
}

/// Storage backed by Redis through a reconnecting connection manager.
pub struct RedisStorage {
    conn: ConnectionManager,
    command_timeout: Duration,
    retry: RetryPolicy,
    increment_script: Script,
    increment_and_get_script: Script,
    cas_script: Script,
    closed: AtomicBool,
    display_url: String,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("url", &self.display_url)
            .field("command_timeout", &self.command_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RedisStorage {
    /// Connect and verify the server answers PING.
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let display_url = settings.redacted_url();
        let client = redis::Client::open(settings.connection_url())?;

        let conn = tokio::time::timeout(settings.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| RateLimitError::StorageTimeout(settings.connect_timeout))??;

        let storage = Self {
            conn,
            command_timeout: settings.command_timeout,
            retry: RetryPolicy::from_settings(settings),
            increment_script: Script::new(INCREMENT_SCRIPT),
            increment_and_get_script: Script::new(INCREMENT_AND_GET_SCRIPT),
            cas_script: Script::new(COMPARE_AND_SET_SCRIPT),
            closed: AtomicBool::new(false),
            display_url,
        };

        let pong: String = storage
            .run("ping", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        info!(url = %storage.display_url, reply = %pong, "Redis storage connected");

        Ok(storage)
    }

    /// Run one command with the per-command timeout and retry policy.
    async fn run<T, F, Fut>(&self, op: &'static str, command: F) -> Result<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(RateLimitError::storage("storage closed"));
        }

        let timeout = self.command_timeout;
        let result = self
            .retry
            .execute(
                || {
                    let pending = command(self.conn.clone());
                    async move {
                        match tokio::time::timeout(timeout, pending).await {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(err)) => Err(CommandError::Redis(err)),
                            Err(_) => Err(CommandError::Timeout(timeout)),
                        }
                    }
                },
                CommandError::is_retryable,
            )
            .await;

        counter!("rate_limit_storage_ops_total", "backend" => "networked", "op" => op).increment(1);
        result.map_err(|err| {
            counter!("rate_limit_storage_errors_total", "backend" => "networked").increment(1);
            warn!(op, error = %err, "Redis command failed");
            RateLimitError::from(err)
        })
    }
}

fn parse_number(raw: Option<String>) -> Result<Option<f64>> {
    raw.map(|text| {
        text.parse::<f64>()
            .map_err(|_| RateLimitError::storage(format!("non-numeric value '{}'", text)))
    })
    .transpose()
}

fn ttl_from_redis(ttl: i64) -> Option<u64> {
    // -2: missing, -1: no expiry
    (ttl >= 0).then_some(ttl as u64)
}

fn stored_from_pair(value: &Value, ttl: &Value) -> Result<StoredValue> {
    let raw: Option<String> = redis::from_redis_value(value)?;
    let ttl: i64 = redis::from_redis_value(ttl)?;
    let value = parse_number(raw)?;
    Ok(StoredValue {
        ttl: value.and(ttl_from_redis(ttl)),
        value,
    })
}

#[async_trait]
impl StorageBackend for RedisStorage {
    async fn increment(&self, key: &str, expire_seconds: u64, amount: i64) -> Result<(i64, u64)> {
        let (value, ttl): (i64, i64) = self
            .run("increment", |mut conn| {
                let mut invocation = self.increment_script.prepare_invoke();
                invocation.key(key).arg(expire_seconds).arg(amount);
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;
        Ok((value, ttl.max(0) as u64))
    }

    async fn increment_and_get(
        &self,
        key: &str,
        expire_seconds: u64,
        amount: i64,
        others: &[&str],
    ) -> Result<((i64, u64), HashMap<String, StoredValue>)> {
        let replies: Vec<Value> = self
            .run("increment_and_get", |mut conn| {
                let mut invocation = self.increment_and_get_script.prepare_invoke();
                invocation.key(key);
                for other in others {
                    invocation.key(*other);
                }
                invocation.arg(expire_seconds).arg(amount);
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        let expected = 2 + others.len() * 2;
        if replies.len() != expected {
            return Err(RateLimitError::storage(format!(
                "expected {} replies, got {}",
                expected,
                replies.len()
            )));
        }

        let value: i64 = redis::from_redis_value(&replies[0])?;
        let ttl: i64 = redis::from_redis_value(&replies[1])?;
        let values = others
            .iter()
            .zip(replies[2..].chunks(2))
            .map(|(other, pair)| Ok((other.to_string(), stored_from_pair(&pair[0], &pair[1])?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(((value, ttl.max(0) as u64), values))
    }

    async fn get(&self, key: &str) -> Result<StoredValue> {
        let (raw, ttl): (Option<String>, i64) = self
            .run("get", |mut conn| async move {
                redis::pipe()
                    .cmd("GET")
                    .arg(key)
                    .cmd("TTL")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let value = parse_number(raw)?;
        Ok(StoredValue {
            ttl: value.and(ttl_from_redis(ttl)),
            value,
        })
    }

    async fn set(&self, key: &str, value: f64, expire_seconds: u64) -> Result<bool> {
        let value = value.to_string();
        self.run("set", |mut conn| {
            let value = value.clone();
            async move {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key).arg(value);
                if expire_seconds > 0 {
                    cmd.arg("EX").arg(expire_seconds);
                }
                cmd.query_async::<_, ()>(&mut conn).await
            }
        })
        .await?;
        Ok(true)
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let deleted: i64 = self
            .run("reset", |mut conn| async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, StoredValue>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let replies: Vec<Value> = self
            .run("get_many", |mut conn| async move {
                let mut pipe = redis::pipe();
                pipe.atomic();
                for key in keys {
                    pipe.cmd("GET").arg(*key).cmd("TTL").arg(*key);
                }
                pipe.query_async(&mut conn).await
            })
            .await?;

        if replies.len() != keys.len() * 2 {
            return Err(RateLimitError::storage(format!(
                "expected {} replies, got {}",
                keys.len() * 2,
                replies.len()
            )));
        }

        keys.iter()
            .zip(replies.chunks(2))
            .map(|(key, pair)| Ok((key.to_string(), stored_from_pair(&pair[0], &pair[1])?)))
            .collect()
    }

    async fn set_many(
        &self,
        values: &[(String, f64)],
        expire_seconds: u64,
        preconditions: &[Precondition],
    ) -> Result<bool> {
        if values.is_empty() {
            return Ok(true);
        }

        if preconditions.is_empty() {
            self.run("set_many", |mut conn| async move {
                let mut pipe = redis::pipe();
                pipe.atomic();
                for (key, value) in values {
                    let cmd = pipe.cmd("SET").arg(key.as_str()).arg(value.to_string());
                    if expire_seconds > 0 {
                        cmd.arg("EX").arg(expire_seconds);
                    }
                    cmd.ignore();
                }
                pipe.query_async::<_, ()>(&mut conn).await
            })
            .await?;
            return Ok(true);
        }

        let written: i64 = self
            .run("set_many", |mut conn| {
                let mut invocation = self.cas_script.prepare_invoke();
                for guard in preconditions {
                    invocation.key(guard.key.as_str());
                }
                for (key, _) in values {
                    invocation.key(key.as_str());
                }
                invocation.arg(expire_seconds).arg(preconditions.len());
                for guard in preconditions {
                    invocation.arg(guard.expected.map(|v| v.to_string()).unwrap_or_default());
                }
                for (_, value) in values {
                    invocation.arg(value.to_string());
                }
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        if written == 0 {
            debug!(guards = preconditions.len(), "Compare-and-set lost a race");
            counter!("rate_limit_storage_ops_total", "backend" => "networked", "op" => "cas_conflict")
                .increment(1);
        }
        Ok(written == 1)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        info!(url = %self.display_url, "Redis storage closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "networked"
    }
}
