//! Redis-backed key-value cache.
//!
//! The gateway uses Redis as an opaque get/set/del store: access-grant
//! UUIDs and the credit ledger live here. Connection failure at startup is
//! fatal; after that, individual command failures are logged and treated
//! as cache misses so a Redis hiccup degrades features instead of taking
//! requests down.

use std::time::Duration;

use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use tracing::error;

#[derive(Clone)]
pub struct Cache {
    pool: Pool,
}

impl Cache {
    /// Build the pool and ping once so a bad `REDIS_DBSTRING` fails fast.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PoolConfig::from_url(url).create_pool(Some(Runtime::Tokio1))?;
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self { pool })
    }

    pub(crate) fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "failed to get redis connection");
                return None;
            }
        };
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, key, "failed to get value from redis");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "failed to get redis connection");
                return;
            }
        };
        if let Err(err) = conn
            .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
        {
            error!(error = %err, key, "failed to set value in redis");
        }
    }

    pub async fn del(&self, key: &str) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "failed to get redis connection");
                return;
            }
        };
        if let Err(err) = conn.del::<_, ()>(key).await {
            error!(error = %err, key, "failed to delete value from redis");
        }
    }

    /// Atomic counter update. Unlike the plain accessors, errors propagate
    /// to the caller.
    pub async fn incr_by(&self, key: &str, delta: i64) -> anyhow::Result<i64> {
        let mut conn = self.pool.get().await?;
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    /// `SET NX`: initialize a key only if it does not exist yet.
    pub async fn set_if_absent(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: bool = conn.set_nx(key, value).await?;
        Ok(())
    }

    /// Unconditional write without TTL, used to clamp ledger balances.
    pub async fn set_persistent(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set(key, value).await?;
        Ok(())
    }
}
