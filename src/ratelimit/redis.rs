//! Redis-backed counter store for deployments where several limiter
//! instances must share one view of the counters.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::counter::{CounterSnapshot, CounterStore, StoreError};
use super::descriptor::CounterKey;
use super::rules::Rule;

/// Atomic fixed-window increment.
///
/// KEYS[1] = counter key
/// ARGV[1] = window length (milliseconds)
///
/// Returns: [count, milliseconds until the window closes]
pub const FIXED_WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])

-- The first hit opens the window
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    -- Key lost its expiry, restart the window from here
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end

return {current, ttl}
"#;

/// Default prefix for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratewarden";

/// Counter store backed by a shared Redis instance.
///
/// Redis expires windows on its own, so [`CounterStore::sweep`] does nothing
/// here. Every command is bounded by `timeout`.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: Script,
    key_prefix: String,
    timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to Redis.
    pub async fn connect(
        redis_url: &str,
        key_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let connection = bounded(timeout, ConnectionManager::new(client)).await?;

        let key_prefix = key_prefix.into();
        info!(prefix = %key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            script: Script::new(FIXED_WINDOW_SCRIPT),
            key_prefix,
            timeout,
        })
    }

    fn redis_key(&self, key: &CounterKey) -> String {
        format!("{}:{}", self.key_prefix, key.to_string_key())
    }

    /// Test the connection.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        bounded(
            self.timeout,
            redis::cmd("PING").query_async::<_, ()>(&mut connection),
        )
        .await
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_check(
        &self,
        key: &CounterKey,
        rule: &Rule,
        now: Instant,
    ) -> Result<CounterSnapshot, StoreError> {
        let redis_key = self.redis_key(key);
        let period_ms = u64::try_from(rule.period().as_millis()).unwrap_or(u64::MAX);
        let mut connection = self.connection.clone();

        let result: Vec<i64> = bounded(
            self.timeout,
            self.script
                .key(&redis_key)
                .arg(period_ms)
                .invoke_async::<_, Vec<i64>>(&mut connection),
        )
        .await?;

        let (count, ttl_ms) = match result.as_slice() {
            [count, ttl] => (*count, *ttl),
            other => {
                return Err(StoreError::Unavailable(format!(
                    "unexpected script reply {:?}",
                    other
                )))
            }
        };

        debug!(key = %redis_key, count, ttl_ms, "Redis counter incremented");

        let ttl = Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0));
        let window_end = now
            .checked_add(ttl)
            .ok_or(StoreError::WindowOutOfRange(ttl))?;
        let window_start = window_end.checked_sub(rule.period()).unwrap_or(now);
        Ok(CounterSnapshot {
            count: u64::try_from(count).unwrap_or(0),
            window_start,
            window_end,
        })
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        bounded(
            self.timeout,
            redis::cmd("DEL")
                .arg(self.redis_key(key))
                .query_async::<_, ()>(&mut connection),
        )
        .await
    }

    async fn sweep(&self, _now: Instant) -> Result<usize, StoreError> {
        Ok(0)
    }

    fn len(&self) -> usize {
        0
    }
}

async fn bounded<T, F>(timeout: Duration, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result.map_err(unavailable),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::descriptor::ClientKey;
    use crate::ratelimit::rules::RuleConfig;

    // These tests require a running Redis instance.
    // They are ignored by default. Run with: cargo test -- --ignored

    async fn create_test_store() -> RedisCounterStore {
        RedisCounterStore::connect(
            "redis://127.0.0.1:6379",
            format!("ratewarden-test-{}", std::process::id()),
            Duration::from_millis(500),
        )
        .await
        .expect("Failed to connect to Redis")
    }

    fn test_key(rule: &Rule, client: &str) -> CounterKey {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        CounterKey::per_client(ClientKey::new(format!("{}-{}", client, nanos)), rule.id().clone())
    }

    #[test]
    fn test_script_is_atomic_fixed_window() {
        assert!(FIXED_WINDOW_SCRIPT.contains("INCR"));
        assert!(FIXED_WINDOW_SCRIPT.contains("PEXPIRE"));
        assert!(FIXED_WINDOW_SCRIPT.contains("PTTL"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let result = RedisCounterStore::connect(
            "redis://127.0.0.1:1",
            DEFAULT_KEY_PREFIX,
            Duration::from_millis(200),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_increment_and_reset() {
        let store = create_test_store().await;
        let rule = Rule::from_config(&RuleConfig::new("/api/*", "1m", 5)).unwrap();
        let key = test_key(&rule, "client");
        let now = Instant::now();

        for i in 1..=3u64 {
            let snapshot = store.increment_and_check(&key, &rule, now).await.unwrap();
            assert_eq!(snapshot.count, i);
            assert!(snapshot.window_end <= now + Duration::from_secs(60));
        }

        store.reset(&key).await.unwrap();
        let snapshot = store.increment_and_check(&key, &rule, now).await.unwrap();
        assert_eq!(snapshot.count, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_window_expires() {
        let store = create_test_store().await;
        let rule = Rule::from_config(&RuleConfig::new("/api/*", "1s", 5)).unwrap();
        let key = test_key(&rule, "expiring");

        store.increment_and_check(&key, &rule, Instant::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let snapshot = store
            .increment_and_check(&key, &rule, Instant::now())
            .await
            .unwrap();
        assert_eq!(snapshot.count, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_connection() {
        let store = create_test_store().await;
        assert!(store.ping().await.is_ok());
    }
}
