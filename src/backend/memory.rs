//! In-process backend store
//!
//! Sorted sets and hashes held behind a single `parking_lot` lock. A batch is
//! applied under one write-lock acquisition, so readers observe either none or
//! all of it. Loses all data on restart; pair it with registry dumps.

use super::{Backend, Batch, BatchOp, Score};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sorted set with member lookup and score ordering
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, Score>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: Score, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            },
            None => false,
        }
    }

    fn range(&self, min: Score, max: Score) -> Vec<(String, Score)> {
        if min > max {
            return Vec::new();
        }
        self.ordered
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Default)]
struct Store {
    zsets: HashMap<String, SortedSet>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Store {
    fn zadd(&mut self, key: &str, score: Score, member: &str) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(score, member);
    }

    fn zrem(&mut self, key: &str, members: &[String]) -> usize {
        let Some(set) = self.zsets.get_mut(key) else {
            return 0;
        };
        let removed = members.iter().filter(|m| set.remove(m)).count();
        if set.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn hdel(&mut self, key: &str, fields: &[String]) -> usize {
        let Some(hash) = self.hashes.get_mut(key) else {
            return 0;
        };
        let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
        if hash.is_empty() {
            self.hashes.remove(key);
        }
        removed
    }

    fn del(&mut self, key: &str) {
        self.zsets.remove(key);
        self.hashes.remove(key);
    }

    fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::ZAdd { key, score, member } => self.zadd(&key, score, &member),
            BatchOp::ZRem { key, members } => {
                self.zrem(&key, &members);
            },
            BatchOp::HSet { key, field, value } => self.hset(&key, &field, &value),
            BatchOp::HDel { key, fields } => {
                self.hdel(&key, &fields);
            },
            BatchOp::Del { key } => self.del(&key),
        }
    }
}

/// In-memory backend store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: RwLock<Store>,
    batches_applied: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sorted-set members under `key`
    pub fn zcard(&self, key: &str) -> usize {
        self.store
            .read()
            .zsets
            .get(key)
            .map(|s| s.scores.len())
            .unwrap_or(0)
    }

    /// Number of fields in the hash under `key`
    pub fn hlen(&self, key: &str) -> usize {
        self.store
            .read()
            .hashes
            .get(key)
            .map(|h| h.len())
            .unwrap_or(0)
    }

    /// Number of live keys of either type
    pub fn key_count(&self) -> usize {
        let store = self.store.read();
        store.zsets.len() + store.hashes.len()
    }

    /// Number of batches executed so far
    pub fn batches_applied(&self) -> u64 {
        self.batches_applied.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn backend_id(&self) -> &str {
        "memory-v1"
    }

    async fn zadd(&self, key: &str, score: Score, member: &str) -> Result<()> {
        self.store.write().zadd(key, score, member);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: Score,
        max: Score,
    ) -> Result<Vec<(String, Score)>> {
        let store = self.store.read();
        Ok(store
            .zsets
            .get(key)
            .map(|s| s.range(min, max))
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<usize> {
        Ok(self.store.write().zrem(key, members))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.store.write().hset(key, field, value);
        Ok(())
    }

    async fn hget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let store = self.store.read();
        let hash = store.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize> {
        Ok(self.store.write().hdel(key, fields))
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        let mut store = self.store.write();
        for key in keys {
            store.del(key);
        }
        Ok(())
    }

    async fn execute(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut store = self.store.write();
        for op in batch.into_ops() {
            store.apply(op);
        }
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
