//! Redis-backed shared store.
//!
//! Requires the `redis` feature. The connection is opened lazily and reopened
//! after I/O failures, so a store that was down at startup is picked up by
//! the client's recovery probe once it comes back.

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisError, Script};
use async_trait::async_trait;
use kiln_core::StoreError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::store::{SharedStore, StoreResult};

const BACKEND: &str = "redis";

/// Compare-and-delete: only the holder of `ARGV[1]` may remove the key.
const DELETE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Set `KEYS[1]` to `ARGV[1]`, expiring in `ARGV[2]` ms unless it already
/// expires later. A key without an expiry keeps none.
const SET_EXTENDING_TTL_SCRIPT: &str = r#"
local ttl = tonumber(ARGV[2])
local current = redis.call("PTTL", KEYS[1])
if current == -1 then
    return redis.call("SET", KEYS[1], ARGV[1], "KEEPTTL")
end
if current > ttl then
    ttl = current
end
return redis.call("SET", KEYS[1], ARGV[1], "PX", ttl)
"#;

/// Redis connection settings.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL (`redis://host:6379/0`, `rediss://...`).
    pub url: String,
    /// Bound on every individual command, connection setup included.
    pub operation_timeout: Duration,
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>, operation_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            operation_timeout,
        }
    }
}

/// Shared store backed by a Redis server.
pub struct RedisStore {
    client: Client,
    config: RedisStoreConfig,
    conn: Mutex<Option<MultiplexedConnection>>,
    delete_if_equals: Script,
    set_extending_ttl: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store. Does not connect until the first command.
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::unavailable(BACKEND, format!("invalid url: {e}")))?;
        Ok(Self {
            client,
            config,
            conn: Mutex::new(None),
            delete_if_equals: Script::new(DELETE_IF_EQUALS_SCRIPT),
            set_extending_ttl: Script::new(SET_EXTENDING_TTL_SCRIPT),
        })
    }

    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = tokio::time::timeout(
            self.config.operation_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::unavailable(BACKEND, "connect timed out"))?
        .map_err(|e| StoreError::unavailable(BACKEND, e))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Run one command with the operation timeout, mapping failures.
    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.config.operation_timeout, f(conn)).await {
            Err(_) => {
                self.reset().await;
                Err(StoreError::unavailable(BACKEND, format!("{op} timed out")))
            }
            Ok(Err(e)) if is_connection_error(&e) => {
                self.reset().await;
                Err(StoreError::unavailable(BACKEND, format!("{op}: {e}")))
            }
            Ok(Err(e)) => Err(StoreError::Corrupt {
                backend: BACKEND.to_string(),
                key: op.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok(value)) => Ok(value),
        }
    }

    async fn reset(&self) {
        *self.conn.lock().await = None;
    }
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.run("GET", |mut conn| async move {
            let value: Option<Vec<u8>> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.run("SET", |mut conn| async move {
            let mut cmd = ::redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            let _: () = cmd.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn set_extending_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let script = &self.set_extending_ttl;
        self.run("EVALSHA", |mut conn| async move {
            let _: ::redis::Value = script
                .key(key)
                .arg(value)
                .arg(millis(ttl))
                .invoke_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        self.run("SET NX", |mut conn| async move {
            let reply: Option<String> = ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.run("DEL", |mut conn| async move {
            let removed: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let script = &self.delete_if_equals;
        self.run("EVALSHA", |mut conn| async move {
            let removed: i64 = script.key(key).arg(expected).invoke_async(&mut conn).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn append_bounded(
        &self,
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let keep = i64::try_from(max_len.max(1)).unwrap_or(i64::MAX);
        self.run("RPUSH", |mut conn| async move {
            let _: () = ::redis::pipe()
                .atomic()
                .cmd("RPUSH")
                .arg(key)
                .arg(item)
                .ignore()
                .cmd("LTRIM")
                .arg(key)
                .arg(-keep)
                .arg(-1)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(millis(ttl))
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn list_all(&self, key: &str) -> StoreResult<Vec<Vec<u8>>> {
        self.run("LRANGE", |mut conn| async move {
            let items: Vec<Vec<u8>> = ::redis::cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;
            Ok(items)
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.run("PING", |mut conn| async move {
            let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_unavailable() {
        let err = RedisStore::new(RedisStoreConfig::new("not a url", Duration::from_secs(1)))
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2_000);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let store = RedisStore::new(RedisStoreConfig::new(
            "redis://127.0.0.1:1/",
            Duration::from_millis(500),
        ))
        .unwrap();
        let err = store.ping().await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
