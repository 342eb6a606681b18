//! Redis backend store
//!
//! Sorted sets map to Redis ZSETs and hashes to Redis hashes. Batches run as
//! `MULTI/EXEC` pipelines so concurrent readers never see a half-applied
//! store or fetch.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollcache::backend::{Backend, RedisBackend, RedisConfig};
//!
//! # async fn example() -> rollcache::Result<()> {
//! let backend = RedisBackend::new(RedisConfig::with_url("redis://127.0.0.1:6379")).await?;
//! backend.zadd("demo:timeline", 128, "128").await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod util;

pub use self::connection::{
    HealthStatus, PoolMetricsSnapshot, RedisConfig, RedisPool, RetryPolicy,
};

use super::{Backend, Batch, BatchOp, Score};
use crate::error::Result;
use async_trait::async_trait;
use redis::Pipeline;
use tracing::debug;

/// Backend store on a Redis server
pub struct RedisBackend {
    pool: RedisPool,
}

impl RedisBackend {
    /// Connect using the given pool configuration
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = RedisPool::new(config).await?;
        debug!(
            url = %util::sanitize_url(&pool.config().url),
            "Redis backend ready"
        );
        Ok(Self { pool })
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }
}

fn queue(pipe: &mut Pipeline, op: &BatchOp) {
    match op {
        BatchOp::ZAdd { key, score, member } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
        },
        BatchOp::ZRem { key, members } => {
            pipe.cmd("ZREM").arg(key).arg(members).ignore();
        },
        BatchOp::HSet { key, field, value } => {
            pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
        },
        BatchOp::HDel { key, fields } => {
            pipe.cmd("HDEL").arg(key).arg(fields).ignore();
        },
        BatchOp::Del { key } => {
            pipe.cmd("DEL").arg(key).ignore();
        },
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn backend_id(&self) -> &str {
        "redis-v1"
    }

    async fn zadd(&self, key: &str, score: Score, member: &str) -> Result<()> {
        self.pool
            .execute(|mut conn| async move {
                redis::cmd("ZADD")
                    .arg(key)
                    .arg(score)
                    .arg(member)
                    .query_async::<()>(&mut conn)
                    .await
            })
            .await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: Score,
        max: Score,
    ) -> Result<Vec<(String, Score)>> {
        if min > max {
            return Ok(Vec::new());
        }
        let raw = self
            .pool
            .execute(|mut conn| async move {
                redis::cmd("ZRANGEBYSCORE")
                    .arg(key)
                    .arg(min)
                    .arg(max)
                    .arg("WITHSCORES")
                    .query_async::<Vec<(String, f64)>>(&mut conn)
                    .await
            })
            .await?;

        // scores are always integral timestamps
        Ok(raw
            .into_iter()
            .map(|(member, score)| (member, score as Score))
            .collect())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        self.pool
            .execute(|mut conn| async move {
                redis::cmd("ZREM")
                    .arg(key)
                    .arg(members)
                    .query_async::<usize>(&mut conn)
                    .await
            })
            .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.pool
            .execute(|mut conn| async move {
                redis::cmd("HSET")
                    .arg(key)
                    .arg(field)
                    .arg(value)
                    .query_async::<()>(&mut conn)
                    .await
            })
            .await
    }

    async fn hget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        self.pool
            .execute(|mut conn| async move {
                redis::cmd("HMGET")
                    .arg(key)
                    .arg(fields)
                    .query_async::<Vec<Option<String>>>(&mut conn)
                    .await
            })
            .await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.pool
            .execute(|mut conn| async move {
                redis::cmd("HDEL")
                    .arg(key)
                    .arg(fields)
                    .query_async::<usize>(&mut conn)
                    .await
            })
            .await
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.pool
            .execute(|mut conn| async move {
                redis::cmd("DEL")
                    .arg(keys)
                    .query_async::<()>(&mut conn)
                    .await
            })
            .await
    }

    async fn execute(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            queue(&mut pipe, op);
        }

        let pipe = &pipe;
        self.pool
            .execute(|mut conn| async move { pipe.query_async::<()>(&mut conn).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[test]
    fn test_queue_builds_atomic_pipeline() {
        let mut batch = Batch::new();
        batch
            .zadd("t:tl", 5, "5")
            .hset("t:h", "5", "[10]")
            .zrem("t:ex", vec!["1".to_string()]);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            queue(&mut pipe, op);
        }
        let packed = String::from_utf8_lossy(&pipe.get_packed_pipeline()).to_string();
        assert!(packed.contains("MULTI"));
        assert!(packed.contains("ZADD"));
        assert!(packed.contains("HSET"));
        assert!(packed.contains("ZREM"));
        assert!(packed.contains("EXEC"));
    }

    #[tokio::test]
    #[ignore] // needs a running Redis server
    async fn test_redis_roundtrip() {
        let backend = RedisBackend::new(RedisConfig::with_url(test_url()))
            .await
            .unwrap();
        let key = format!("rollcache-test:{}", std::process::id());
        let tl = format!("{key}:timeline");
        let h = format!("{key}:entries");

        let mut batch = Batch::new();
        batch.zadd(&tl, 100, "100").zadd(&tl, 200, "200").hset(&h, "100", "[400]");
        backend.execute(batch).await.unwrap();

        let range = backend.zrange_by_score(&tl, 0, 150).await.unwrap();
        assert_eq!(range, vec![("100".to_string(), 100)]);

        let got = backend
            .hget(&h, &["100".to_string(), "999".to_string()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some("[400]".to_string()), None]);

        backend.del(&[tl.clone(), h.clone()]).await.unwrap();
        assert!(backend.zrange_by_score(&tl, 0, 1000).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // needs a running Redis server
    async fn test_redis_health_check() {
        let backend = RedisBackend::new(RedisConfig::with_url(test_url()))
            .await
            .unwrap();
        let status = backend.pool().health_check().await;
        assert_ne!(status, HealthStatus::Unhealthy);
    }
}
