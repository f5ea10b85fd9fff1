//! Distributed window store backed by Redis.
//!
//! Each identifier's window is a sorted set of request timestamps. Admission
//! runs as one Lua script so the prune, count and record steps are atomic
//! across every process sharing the server.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{StoreError, WindowDecision, WindowSnapshot, WindowStore};
use super::rules::RateLimitConfig;
use crate::config::StoreConfig;

/// KEYS[1] window key; ARGV now_ms, window_ms, ceiling, member.
/// Returns {allowed, count, reset_at_ms}.
const CHECK_AND_RECORD_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local ceiling = tonumber(ARGV[3])
local member = ARGV[4]

redis.call("ZREMRANGEBYSCORE", key, "-inf", now - window)

local count = redis.call("ZCARD", key)
local allowed = 0
if count < ceiling then
    redis.call("ZADD", key, now, member)
    redis.call("PEXPIRE", key, window)
    count = count + 1
    allowed = 1
end

local reset_at = now + window
local oldest = redis.call("ZRANGE", key, 0, 0, "WITHSCORES")
if #oldest > 0 then
    reset_at = tonumber(oldest[2]) + window
end

return {allowed, count, reset_at}
"#;

/// A window store shared by every process connected to the same Redis.
pub struct RedisWindowStore {
    connection_manager: ConnectionManager,
    key_prefix: String,
    response_timeout: Duration,
    script: Script,
}

impl RedisWindowStore {
    /// Connect to the configured server.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| StoreError::Connection("no store host configured".to_string()))?;

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, config.port),
            redis: RedisConnectionInfo {
                db: config.db,
                password: config.password.clone(),
                ..Default::default()
            },
        };
        let client = Client::open(info)?;

        let connection_manager =
            with_timeout(config.connect_timeout(), client.get_connection_manager()).await?;

        Ok(Self {
            connection_manager,
            key_prefix: config.key_prefix.clone(),
            response_timeout: config.response_timeout(),
            script: Script::new(CHECK_AND_RECORD_SCRIPT),
        })
    }

    /// Redis key holding the window for `identifier`.
    pub fn window_key(prefix: &str, identifier: &str) -> String {
        format!("{}window:{}", prefix, identifier)
    }

    fn key(&self, identifier: &str) -> String {
        Self::window_key(&self.key_prefix, identifier)
    }
}

/// Bound a store round trip by `limit`.
async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Exclusive lower score bound for a window ending at `now_ms`.
fn window_min(window_ms: u64, now_ms: u64) -> String {
    format!("({}", now_ms as i64 - window_ms as i64)
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn check_and_record(
        &self,
        config: &RateLimitConfig,
        now_ms: u64,
    ) -> Result<WindowDecision, StoreError> {
        let key = self.key(&config.identifier);
        let member = format!("{}:{}", now_ms, Uuid::new_v4());
        let ceiling = config.ceiling();
        let mut connection_manager = self.connection_manager.clone();

        let mut invocation = self.script.key(&key);
        invocation
            .arg(now_ms)
            .arg(config.window_ms)
            .arg(ceiling)
            .arg(member);

        let (allowed, count, reset_at_ms): (i64, i64, i64) = with_timeout(
            self.response_timeout,
            invocation.invoke_async(&mut connection_manager),
        )
        .await?;

        let count = count.max(0) as u32;
        let allowed = allowed == 1;

        trace!(
            key = %key,
            allowed = allowed,
            count = count,
            "Checked shared window"
        );

        Ok(WindowDecision {
            allowed,
            count,
            remaining: ceiling.saturating_sub(count),
            reset_at_ms: reset_at_ms.max(0) as u64,
            burst: allowed && count > config.max_requests,
        })
    }

    async fn snapshot(
        &self,
        identifier: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowSnapshot, StoreError> {
        let key = self.key(identifier);
        let min = window_min(window_ms, now_ms);
        let mut connection_manager = self.connection_manager.clone();

        let mut pipe = redis::pipe();
        pipe.cmd("ZCOUNT")
            .arg(&key)
            .arg(&min)
            .arg("+inf")
            .cmd("ZRANGEBYSCORE")
            .arg(&key)
            .arg(&min)
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(1);

        let (count, oldest): (u32, Vec<(String, f64)>) =
            with_timeout(self.response_timeout, pipe.query_async(&mut connection_manager)).await?;

        Ok(WindowSnapshot {
            count,
            oldest_ms: oldest.first().map(|(_, score)| *score as u64),
        })
    }

    async fn clear(&self, identifier: Option<&str>) -> Result<(), StoreError> {
        let mut connection_manager = self.connection_manager.clone();

        let keys: Vec<String> = match identifier {
            Some(id) => vec![self.key(id)],
            None => {
                let pattern = format!("{}*", Self::window_key(&self.key_prefix, ""));
                with_timeout(
                    self.response_timeout,
                    redis::cmd("KEYS").arg(&pattern).query_async(&mut connection_manager),
                )
                .await?
            }
        };

        if keys.is_empty() {
            return Ok(());
        }

        debug!(keys = keys.len(), "Clearing shared windows");
        let _: i64 = with_timeout(
            self.response_timeout,
            redis::cmd("DEL").arg(&keys).query_async(&mut connection_manager),
        )
        .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key() {
        assert_eq!(
            RedisWindowStore::window_key("ratewarden:", "polygon_free_tier"),
            "ratewarden:window:polygon_free_tier"
        );
    }

    #[test]
    fn test_window_min_is_exclusive() {
        assert_eq!(window_min(1_000, 5_000), "(4000");
        assert_eq!(window_min(1_000, 500), "(-500");
    }

    #[tokio::test]
    async fn test_connect_without_host_fails() {
        let result = RedisWindowStore::connect(&StoreConfig::default()).await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_fails() {
        let config = StoreConfig {
            host: Some("127.0.0.1".to_string()),
            port: 1,
            connect_timeout_ms: 500,
            ..StoreConfig::default()
        };
        assert!(RedisWindowStore::connect(&config).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<(), StoreError> = with_timeout(
            Duration::from_millis(10),
            std::future::pending::<redis::RedisResult<()>>(),
        )
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
