//! Redis-backed cache backend (optional, `redis` feature).

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use super::cache::{CacheBackend, CacheError};

/// Redis `GET` / `SET EX` over one multiplexed async connection.
#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: MultiplexedConnection,
}

impl RedisCacheBackend {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(format!("PING failed: {e}")))?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| CacheError::Unavailable(format!("GET failed: {e}")))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| CacheError::Unavailable(format!("SET failed: {e}")))
    }
}
