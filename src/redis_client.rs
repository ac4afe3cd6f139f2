use anyhow::{Context, Result};
use redis::{aio::ConnectionManager, AsyncCommands, RedisError};

/// Async Redis wrapper used as the shared backing for the rate-limit
/// store. Only the sorted-set sliding-window command set is exposed.
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        if !redis_url.contains("://") {
            anyhow::bail!("invalid Redis URL, expected redis://[:password@]host:port");
        }

        let client = redis::Client::open(redis_url).context("failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("failed to connect to Redis")?;
        Ok(Self { manager })
    }

    /// Add a member to a sorted set, scored by timestamp.
    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), RedisError> {
        let mut conn = self.manager.clone();
        conn.zadd(key, member, score).await
    }

    /// Drop sorted-set members whose score falls outside the window.
    pub async fn zrembyscore(&self, key: &str, min: f64, max: f64) -> Result<i64, RedisError> {
        let mut conn = self.manager.clone();
        conn.zrembyscore(key, min, max).await
    }

    /// Count sorted-set members within a score range.
    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<i64, RedisError> {
        let mut conn = self.manager.clone();
        conn.zcount(key, min, max).await
    }

    /// Oldest members with scores, for retry-after computation.
    pub async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, RedisError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> Result<bool, RedisError> {
        let mut conn = self.manager.clone();
        conn.expire(key, seconds).await
    }

    pub async fn ping(&self) -> Result<bool, RedisError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|resp| resp == "PONG")
    }
}
