//! Metadata index over a collection's cached buckets
//!
//! Tracks, per (collection, tagging), which timestamps exist and when each one
//! expires. Two orderings are kept over the same entries so that range
//! queries walk the timeline and expiry sweeps walk the expiry ordering, each
//! without scanning the other.
//!
//! # Backend Key Schema
//!
//! ```text
//! {prefix}:{collection}:{tagging}:timeline  → ZSET(ts → ts)
//! {prefix}:{collection}:{tagging}:expire    → ZSET(expire_at → ts)
//! {prefix}:{collection}:{tagging}:entries   → HASH {ts: "[expire_at, args...]"}
//! ```
//!
//! Creation and removal touch all three keys inside one [`Batch`], so a
//! reader never sees an entry present in one ordering and missing from the
//! other.
//!
//! The index does not lock. Callers serialise check-then-act sequences
//! (existence check followed by creation) per collection.

use crate::backend::{Backend, Batch, Score};
use crate::error::{Error, Result};
use crate::types::{MetadataEntry, Timestamp};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const TIMELINE_SUFFIX: &str = "timeline";
const EXPIRE_SUFFIX: &str = "expire";
const ENTRIES_SUFFIX: &str = "entries";

/// Timeline and expiry orderings for every tagging of one collection
#[derive(Clone)]
pub struct MetadataIndex {
    backend: Arc<dyn Backend>,
    namespace: String,
}

impl std::fmt::Debug for MetadataIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataIndex")
            .field("backend", &self.backend.backend_id())
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl MetadataIndex {
    /// Create the index of `collection`, keyed under `key_prefix`
    pub fn new(backend: Arc<dyn Backend>, key_prefix: &str, collection: &str) -> Self {
        Self {
            backend,
            namespace: format!("{}:{}", key_prefix, collection),
        }
    }

    /// Key of a per-tagging structure, `{prefix}:{collection}:{tagging}:{purpose}`
    ///
    /// Collections keep their values under the same scheme with their own
    /// purpose suffix.
    pub fn key(&self, tagging: &str, purpose: &str) -> String {
        format!("{}:{}:{}", self.namespace, tagging, purpose)
    }

    fn timeline_key(&self, tagging: &str) -> String {
        self.key(tagging, TIMELINE_SUFFIX)
    }

    fn expire_key(&self, tagging: &str) -> String {
        self.key(tagging, EXPIRE_SUFFIX)
    }

    fn entries_key(&self, tagging: &str) -> String {
        self.key(tagging, ENTRIES_SUFFIX)
    }

    /// Backend the index writes to
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Recorded entry for `(tagging, ts)`, if any
    pub async fn get(&self, tagging: &str, ts: Timestamp) -> Result<Option<MetadataEntry>> {
        let raw = self
            .backend
            .hget(&self.entries_key(tagging), &[ts.to_string()])
            .await?;
        match raw.into_iter().next().flatten() {
            Some(encoded) => Ok(Some(decode_entry(ts, &encoded)?)),
            None => Ok(None),
        }
    }

    /// Whether an entry exists for `(tagging, ts)`
    pub async fn contains(&self, tagging: &str, ts: Timestamp) -> Result<bool> {
        Ok(self.get(tagging, ts).await?.is_some())
    }

    /// Entries with `start <= ts <= end`, ascending by `ts`
    ///
    /// Empty when `start > end` or the tagging is unknown.
    pub async fn range_by_timeline(
        &self,
        tagging: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<MetadataEntry>> {
        if start > end {
            return Ok(Vec::new());
        }

        let members = self
            .backend
            .zrange_by_score(&self.timeline_key(tagging), start, end)
            .await?;
        let mut stamps = parse_members(members)?;
        stamps.sort_unstable();
        self.load_entries(tagging, stamps).await
    }

    /// Entries with `expire_at <= sentinel`, ascending by `expire_at`
    ///
    /// Entries sharing an expiry time come out in ascending `ts` order.
    pub async fn range_by_expiry(
        &self,
        tagging: &str,
        sentinel: Timestamp,
    ) -> Result<Vec<MetadataEntry>> {
        let members = self
            .backend
            .zrange_by_score(&self.expire_key(tagging), Score::MIN, sentinel)
            .await?;
        let stamps = parse_members(members)?;
        let mut entries = self.load_entries(tagging, stamps).await?;
        entries.sort_by_key(|e| (e.expire_at, e.ts));
        Ok(entries)
    }

    /// Every entry of a tagging, ascending by `ts`
    pub async fn snapshot(&self, tagging: &str) -> Result<Vec<MetadataEntry>> {
        self.range_by_timeline(tagging, Timestamp::MIN, Timestamp::MAX)
            .await
    }

    async fn load_entries(
        &self,
        tagging: &str,
        stamps: Vec<Timestamp>,
    ) -> Result<Vec<MetadataEntry>> {
        if stamps.is_empty() {
            return Ok(Vec::new());
        }

        let fields: Vec<String> = stamps.iter().map(|ts| ts.to_string()).collect();
        let raw = self.backend.hget(&self.entries_key(tagging), &fields).await?;

        let mut entries = Vec::with_capacity(stamps.len());
        for (ts, encoded) in stamps.into_iter().zip(raw) {
            match encoded {
                Some(encoded) => entries.push(decode_entry(ts, &encoded)?),
                // removed between the range read and the hash read
                None => debug!(tagging, ts, "Skipping entry without metadata"),
            }
        }
        Ok(entries)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Queue creation of `entry` in all three structures
    ///
    /// Overwrites whatever is recorded for the same `ts`; callers check
    /// existence first when first-writer-wins applies.
    pub fn stage_entry(
        &self,
        batch: &mut Batch,
        tagging: &str,
        entry: &MetadataEntry,
    ) -> Result<()> {
        let member = entry.ts.to_string();
        batch
            .zadd(self.timeline_key(tagging), entry.ts, member.clone())
            .zadd(self.expire_key(tagging), entry.expire_at, member.clone())
            .hset(self.entries_key(tagging), member, encode_entry(entry)?);
        Ok(())
    }

    /// Create the entry unless one already exists for `(tagging, entry.ts)`
    ///
    /// Returns whether a new entry was created. An existing entry keeps the
    /// `expire_at` and `args` of its first writer.
    pub async fn ensure_entry(&self, tagging: &str, entry: MetadataEntry) -> Result<bool> {
        if self.contains(tagging, entry.ts).await? {
            return Ok(false);
        }

        let mut batch = Batch::new();
        self.stage_entry(&mut batch, tagging, &entry)?;
        self.backend.execute(batch).await?;
        debug!(tagging, ts = entry.ts, expire_at = entry.expire_at, "Created metadata entry");
        Ok(true)
    }

    /// Queue removal of the given timestamps from all three structures
    pub fn stage_removal(&self, batch: &mut Batch, tagging: &str, stamps: &[Timestamp]) {
        let members: Vec<String> = stamps.iter().map(|ts| ts.to_string()).collect();
        batch
            .zrem(self.timeline_key(tagging), members.clone())
            .zrem(self.expire_key(tagging), members.clone())
            .hdel(self.entries_key(tagging), members);
    }

    /// Remove the given entries in one batch
    pub async fn remove_entries(&self, tagging: &str, entries: &[MetadataEntry]) -> Result<()> {
        let stamps: Vec<Timestamp> = entries.iter().map(|e| e.ts).collect();
        let mut batch = Batch::new();
        self.stage_removal(&mut batch, tagging, &stamps);
        self.backend.execute(batch).await
    }

    /// Queue deletion of every structure of a tagging
    pub fn stage_clear(&self, batch: &mut Batch, tagging: &str) {
        batch
            .del(self.timeline_key(tagging))
            .del(self.expire_key(tagging))
            .del(self.entries_key(tagging));
    }

    /// Write snapshot entries back in one batch
    pub async fn restore(&self, tagging: &str, entries: &[MetadataEntry]) -> Result<()> {
        let mut batch = Batch::new();
        for entry in entries {
            self.stage_entry(&mut batch, tagging, entry)?;
        }
        self.backend.execute(batch).await
    }
}

fn parse_members(members: Vec<(String, Score)>) -> Result<Vec<Timestamp>> {
    members
        .into_iter()
        .map(|(member, _)| {
            member.parse::<Timestamp>().map_err(|_| {
                Error::Serialization(format!("Invalid timestamp member '{}' in index", member))
            })
        })
        .collect()
}

fn encode_entry(entry: &MetadataEntry) -> Result<String> {
    let mut fields = Vec::with_capacity(entry.args.len() + 1);
    fields.push(Value::from(entry.expire_at));
    fields.extend(entry.args.iter().cloned());
    Ok(serde_json::to_string(&fields)?)
}

fn decode_entry(ts: Timestamp, encoded: &str) -> Result<MetadataEntry> {
    let mut fields: Vec<Value> = serde_json::from_str(encoded)?;
    if fields.is_empty() {
        return Err(Error::Serialization(format!("Empty metadata for ts {}", ts)));
    }
    let expire_at = fields.remove(0).as_i64().ok_or_else(|| {
        Error::Serialization(format!("Metadata for ts {} has a non-integer expiry", ts))
    })?;
    Ok(MetadataEntry::new(ts, expire_at).with_args(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    fn index() -> (Arc<MemoryBackend>, MetadataIndex) {
        let backend = Arc::new(MemoryBackend::new());
        let index = MetadataIndex::new(backend.clone(), "test", "hits");
        (backend, index)
    }

    #[test]
    fn test_key_schema() {
        let (_, index) = index();
        assert_eq!(index.key("foo", "timeline"), "test:hits:foo:timeline");
        assert_eq!(index.expire_key("foo"), "test:hits:foo:expire");
        assert_eq!(index.entries_key("foo"), "test:hits:foo:entries");
    }

    #[test]
    fn test_entry_encoding() {
        let entry = MetadataEntry::new(128, 428).with_args(vec![json!("src"), json!(3)]);
        let encoded = encode_entry(&entry).unwrap();
        assert_eq!(encoded, r#"[428,"src",3]"#);
        assert_eq!(decode_entry(128, &encoded).unwrap(), entry);

        assert!(decode_entry(1, "[]").is_err());
        assert!(decode_entry(1, r#"["x"]"#).is_err());
    }

    #[tokio::test]
    async fn test_ensure_entry_first_writer_wins() {
        let (_, index) = index();

        let created = index
            .ensure_entry("foo", MetadataEntry::new(128, 428).with_args(vec![json!("a")]))
            .await
            .unwrap();
        assert!(created);

        let created = index
            .ensure_entry("foo", MetadataEntry::new(128, 999).with_args(vec![json!("b")]))
            .await
            .unwrap();
        assert!(!created);

        let entry = index.get("foo", 128).await.unwrap().unwrap();
        assert_eq!(entry.expire_at, 428);
        assert_eq!(entry.args, vec![json!("a")]);

        // still present once in each ordering
        assert_eq!(index.range_by_timeline("foo", 0, 1000).await.unwrap().len(), 1);
        assert_eq!(index.range_by_expiry("foo", 1000).await.unwrap().len(), 1);
        assert!(index.range_by_expiry("foo", 500).await.unwrap().len() == 1);
        assert!(index.range_by_expiry("foo", 427).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_by_timeline() {
        let (_, index) = index();
        for ts in [300, 100, 200] {
            index
                .ensure_entry("foo", MetadataEntry::new(ts, ts + 10))
                .await
                .unwrap();
        }

        let stamps: Vec<_> = index
            .range_by_timeline("foo", 100, 200)
            .await
            .unwrap()
            .iter()
            .map(|e| e.ts)
            .collect();
        assert_eq!(stamps, vec![100, 200]);

        assert!(index.range_by_timeline("foo", 200, 100).await.unwrap().is_empty());
        assert!(index.range_by_timeline("other", 0, 1000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_by_expiry_orders_by_expiry_then_ts() {
        let (_, index) = index();
        index.ensure_entry("t", MetadataEntry::new(30, 100)).await.unwrap();
        index.ensure_entry("t", MetadataEntry::new(10, 500)).await.unwrap();
        index.ensure_entry("t", MetadataEntry::new(20, 100)).await.unwrap();

        let order: Vec<_> = index
            .range_by_expiry("t", 1_000)
            .await
            .unwrap()
            .iter()
            .map(|e| (e.expire_at, e.ts))
            .collect();
        assert_eq!(order, vec![(100, 20), (100, 30), (500, 10)]);

        let expired = index.range_by_expiry("t", 100).await.unwrap();
        assert_eq!(expired.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_entries_clears_both_orderings() {
        let (backend, index) = index();
        for ts in [1, 2, 3] {
            index.ensure_entry("t", MetadataEntry::new(ts, ts)).await.unwrap();
        }

        let doomed = index.range_by_expiry("t", 2).await.unwrap();
        index.remove_entries("t", &doomed).await.unwrap();

        let left = index.snapshot("t").await.unwrap();
        assert_eq!(left, vec![MetadataEntry::new(3, 3)]);
        assert_eq!(backend.zcard("test:hits:t:timeline"), 1);
        assert_eq!(backend.zcard("test:hits:t:expire"), 1);
        assert_eq!(backend.hlen("test:hits:t:entries"), 1);
        assert!(!index.contains("t", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_entry_joins_caller_batch() {
        let (backend, index) = index();
        let mut batch = Batch::new();
        index
            .stage_entry(&mut batch, "t", &MetadataEntry::new(5, 50))
            .unwrap();
        batch.hset("test:hits:t:values", "5", "{}");
        assert_eq!(batch.len(), 4);

        backend.execute(batch).await.unwrap();
        assert_eq!(backend.batches_applied(), 1);
        assert!(index.contains("t", 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let (_, index) = index();
        let entries = vec![
            MetadataEntry::new(1, 301),
            MetadataEntry::new(2, 302).with_args(vec![json!({"k": 1})]),
        ];
        index.restore("t", &entries).await.unwrap();
        assert_eq!(index.snapshot("t").await.unwrap(), entries);

        let mut batch = Batch::new();
        index.stage_clear(&mut batch, "t");
        index.backend().execute(batch).await.unwrap();
        assert!(index.snapshot("t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_negative_timestamps() {
        let (_, index) = index();
        index.ensure_entry("t", MetadataEntry::new(-10, 5)).await.unwrap();
        index.ensure_entry("t", MetadataEntry::new(10, 5)).await.unwrap();
        let stamps: Vec<_> = index
            .snapshot("t")
            .await
            .unwrap()
            .iter()
            .map(|e| e.ts)
            .collect();
        assert_eq!(stamps, vec![-10, 10]);
    }
}
