//! Shared key-value store (Redis) abstraction
//!
//! One pooled set of command connections plus a dedicated pub/sub connection
//! per process (a subscribed connection cannot issue unrelated commands).
//! Every command is bounded by the configured command timeout, and every
//! gateway key goes through [`RedisStore::key`] so a deployment-wide prefix
//! can namespace multiple gateways on one store.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use crate::config::RedisConfig;

/// Errors surfaced by shared-store commands
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Pool exhausted or connection could not be established
    #[error("store connection error: {0}")]
    Connection(String),
    /// Command failed on the server or wire
    #[error("store command error: {0}")]
    Command(#[from] redis::RedisError),
    /// Command exceeded the configured timeout
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),
}

/// Redis-backed shared store
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
    /// Raw client kept for dedicated pub/sub connections
    client: redis::Client,
    key_prefix: String,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connect to the shared store and verify the connection with a PING
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager = RedisConnectionManager::new(config.url.as_str())?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.connect_timeout())
            .build(manager)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            client,
            key_prefix: config.key_prefix.clone(),
            command_timeout: config.command_timeout(),
        };

        store.ping().await?;
        info!("Connected to shared store at {}", config.url);

        Ok(store)
    }

    /// Apply the configured key prefix
    pub fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.key_prefix, suffix)
    }

    /// Verify the store is reachable
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: String = self
            .timed(redis::cmd("PING").query_async(&mut *conn))
            .await?;
        Ok(())
    }

    async fn conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }

    // String operations

    /// GET key
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.get::<_, Option<String>>(key)).await
    }

    /// SETEX key seconds value
    pub async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.set_ex::<_, _, ()>(key, value, seconds))
            .await
    }

    /// SET key value NX PX millis - returns whether the key was created
    pub async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = self
            .timed(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut *conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    /// DEL key - returns whether a key was removed
    pub async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = self.timed(conn.del::<_, i64>(key)).await?;
        Ok(removed > 0)
    }

    // Counter operations

    /// INCR key
    pub async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.incr::<_, _, i64>(key, 1)).await
    }

    /// EXPIRE key seconds
    pub async fn expire(&self, key: &str, seconds: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.expire::<_, bool>(key, seconds)).await
    }

    /// TTL key - seconds remaining, negative when missing or unset
    pub async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.ttl::<_, i64>(key)).await
    }

    // Set operations

    /// SMEMBERS key
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.smembers::<_, Vec<String>>(key)).await
    }

    /// SADD key member - returns whether the member was new
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let added: i64 = self.timed(conn.sadd::<_, _, i64>(key, member)).await?;
        Ok(added > 0)
    }

    /// SREM key member - returns whether the member was present
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = self.timed(conn.srem::<_, _, i64>(key, member)).await?;
        Ok(removed > 0)
    }

    // Hash operations

    /// HGETALL key
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.hgetall::<_, HashMap<String, String>>(key))
            .await
    }

    /// HGET key field
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.hget::<_, _, Option<String>>(key, field))
            .await
    }

    /// HSET key field value
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        self.timed(conn.hset::<_, _, _, ()>(key, field, value))
            .await
    }

    /// HDEL key field - returns whether a field was removed
    pub async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = self.timed(conn.hdel::<_, _, i64>(key, field)).await?;
        Ok(removed > 0)
    }

    // Scripting and pub/sub

    /// Run a prepared server-side script invocation
    pub async fn eval_script<T: redis::FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn().await?;
        self.timed(invocation.invoke_async(&mut *conn)).await
    }

    /// PUBLISH channel message
    pub async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: i64 = self
            .timed(conn.publish::<_, _, i64>(channel, message))
            .await?;
        Ok(())
    }

    /// Open a dedicated pub/sub connection.
    ///
    /// Pub/sub mode pins the connection, so this never comes from the
    /// command pool.
    pub async fn subscriber(&self) -> Result<redis::aio::PubSub, StoreError> {
        let pubsub = self.client.get_async_pubsub().await?;
        Ok(pubsub)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}
