//! Backend store abstraction
//!
//! The engine consumes the store only through the [`Backend`] trait: sorted
//! sets scored by integer timestamps, hashes of string fields, and atomic
//! [`Batch`] execution. Two implementations ship with the crate:
//!
//! - [`MemoryBackend`] keeps everything in process (tests, single-node use)
//! - [`RedisBackend`] talks to a Redis server through a pooled multiplexed
//!   connection, running batches as `MULTI/EXEC` pipelines
//!
//! # Example
//!
//! ```rust
//! use rollcache::backend::{Backend, Batch, MemoryBackend};
//!
//! # async fn example() -> rollcache::Result<()> {
//! let backend = MemoryBackend::new();
//!
//! let mut batch = Batch::new();
//! batch.zadd("timeline", 128, "128");
//! batch.hset("entries", "128", "[428]");
//! backend.execute(batch).await?;
//!
//! let members = backend.zrange_by_score("timeline", 0, 1000).await?;
//! assert_eq!(members, vec![("128".to_string(), 128)]);
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::{RedisBackend, RedisConfig, RetryPolicy};

use crate::config::{BackendConfig, BackendKind};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Sorted-set score; the engine only ever scores by timestamp
pub type Score = i64;

/// A single queued write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Add or rescore a sorted-set member
    ZAdd {
        /// Sorted-set key
        key: String,
        /// Score
        score: Score,
        /// Member
        member: String,
    },
    /// Remove sorted-set members
    ZRem {
        /// Sorted-set key
        key: String,
        /// Members to remove
        members: Vec<String>,
    },
    /// Set a hash field
    HSet {
        /// Hash key
        key: String,
        /// Field
        field: String,
        /// Encoded value
        value: String,
    },
    /// Delete hash fields
    HDel {
        /// Hash key
        key: String,
        /// Fields to delete
        fields: Vec<String>,
    },
    /// Delete a whole key
    Del {
        /// Key
        key: String,
    },
}

/// Writes applied indivisibly with respect to readers
///
/// Empty `ZRem`/`HDel` operations are dropped when queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a sorted-set add
    pub fn zadd(&mut self, key: impl Into<String>, score: Score, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        });
        self
    }

    /// Queue a sorted-set removal
    pub fn zrem(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(BatchOp::ZRem {
                key: key.into(),
                members,
            });
        }
        self
    }

    /// Queue a hash field write
    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(BatchOp::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Queue a hash field deletion
    pub fn hdel(&mut self, key: impl Into<String>, fields: Vec<String>) -> &mut Self {
        if !fields.is_empty() {
            self.ops.push(BatchOp::HDel {
                key: key.into(),
                fields,
            });
        }
        self
    }

    /// Queue a whole-key deletion
    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    /// Append every operation of `other`
    pub fn extend(&mut self, other: Batch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queued operations in order
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Consume the batch into its operations
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key/value + sorted-set store consumed by the engine
///
/// All calls may suspend for an unbounded time; implementations own any
/// retry policy.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Unique identifier for this backend
    fn backend_id(&self) -> &str;

    /// Add or rescore a member
    async fn zadd(&self, key: &str, score: Score, member: &str) -> Result<()>;

    /// Members with `min <= score <= max`, ascending by score
    async fn zrange_by_score(&self, key: &str, min: Score, max: Score)
        -> Result<Vec<(String, Score)>>;

    /// Remove members, returning how many existed
    async fn zrem(&self, key: &str, members: &[String]) -> Result<usize>;

    /// Set a hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Read hash fields; the result is positional with `None` for missing fields
    async fn hget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;

    /// Delete hash fields, returning how many existed
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize>;

    /// Delete whole keys
    async fn del(&self, keys: &[String]) -> Result<()>;

    /// Apply every queued operation indivisibly
    async fn execute(&self, batch: Batch) -> Result<()>;
}

/// Build the backend selected by configuration
pub async fn connect(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    match config.kind {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendKind::Redis => {
            let redis_config = RedisConfig::from(config);
            Ok(Arc::new(RedisBackend::new(redis_config).await?))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder() {
        let mut batch = Batch::new();
        batch
            .zadd("tl", 1, "1")
            .hset("h", "f", "v")
            .zrem("tl", vec![])
            .hdel("h", vec![]);

        // empty removals are dropped
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[0], BatchOp::ZAdd { score: 1, .. }));
    }

    #[test]
    fn test_batch_extend() {
        let mut a = Batch::new();
        a.del("k1");
        let mut b = Batch::new();
        b.del("k2").del("k3");
        a.extend(b);
        assert_eq!(a.len(), 3);
        assert!(!a.is_empty());
        assert_eq!(
            a.into_ops().last(),
            Some(&BatchOp::Del {
                key: "k3".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let backend = connect(&BackendConfig::default()).await.unwrap();
        assert_eq!(backend.backend_id(), "memory-v1");
    }
}
