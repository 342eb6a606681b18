//! Shared engine behind every collection variant
//!
//! Values live next to the metadata index under
//! `{prefix}:{collection}:{tagging}:values` (hash, field = ts, value = JSON).
//!
//! Check-then-act sequences (store, fetch with delete, delete, pop, dump,
//! load, clear) hold a per-collection async mutex and end in a single atomic
//! batch, so a key never has metadata without a value or the reverse.

use super::{Collection, DumpRecord, IndexSnapshot, KeyedValues, ValueSnapshot};
use crate::backend::Batch;
use crate::error::{Error, Result};
use crate::index::MetadataIndex;
use crate::metrics;
use crate::types::{
    entry_key, parse_entry_key, CacheValue, CollectionKind, FetchOptions, MetadataEntry,
    QueryOptions, StoreOptions, StoreOutcome, Timestamp, ALL_TAGGINGS, FAR_FUTURE,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const VALUES_SUFFIX: &str = "values";

/// How a collection variant validates, merges and renders its values
pub trait MergeRule: Send + Sync + 'static {
    /// Value cached per key
    type Stored: Serialize + DeserializeOwned + Default + Send + Sync;

    /// Validated store payload
    type Input: Send;

    /// Variant this rule implements
    fn kind(&self) -> CollectionKind;

    /// Validate the shape of a store payload
    fn accept(&self, value: CacheValue) -> Result<Self::Input>;

    /// Merge `input` into `stored`, returning how many fields or members were written
    fn merge(&self, stored: &mut Self::Stored, input: Self::Input) -> usize;

    /// Shape a cached value for a query or fetch
    fn render(&self, stored: Self::Stored, read: &QueryOptions) -> CacheValue;

    /// Reject a merged value that could not be stored and read back
    fn check(&self, _stored: &Self::Stored) -> Result<()> {
        Ok(())
    }

    /// Remove up to `n` members from a cached value
    fn pop(&self, _stored: &mut Self::Stored, _n: usize) -> Result<Vec<String>> {
        Err(Error::Validation(format!(
            "pop is only supported by unique collections, '{}' is not one",
            self.kind()
        )))
    }
}

/// A collection parameterised by its merge rule
pub struct TaggedCollection<R> {
    name: String,
    default_expire: i64,
    rule: R,
    index: MetadataIndex,
    taggings: RwLock<BTreeSet<String>>,
    lock: Mutex<()>,
}

impl<R: MergeRule> TaggedCollection<R> {
    /// Create an empty collection over `index`
    pub fn new(name: &str, default_expire: i64, rule: R, index: MetadataIndex) -> Self {
        Self {
            name: name.to_string(),
            default_expire,
            rule,
            index,
            taggings: RwLock::new(BTreeSet::new()),
            lock: Mutex::new(()),
        }
    }

    /// Metadata index of this collection
    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    fn values_key(&self, tagging: &str) -> String {
        self.index.key(tagging, VALUES_SUFFIX)
    }

    fn register_tagging(&self, tagging: &str) {
        if self.taggings.read().contains(tagging) {
            return;
        }
        if self.taggings.write().insert(tagging.to_string()) {
            debug!(collection = %self.name, tagging, "New tagging");
        }
    }

    fn resolve_taggings(&self, tagging: &str) -> Vec<String> {
        if tagging == ALL_TAGGINGS {
            self.taggings.read().iter().cloned().collect()
        } else {
            vec![tagging.to_string()]
        }
    }

    fn observe<T>(&self, operation: &str, start: Instant, result: &Result<T>) {
        let kind = self.rule.kind().as_str();
        metrics::record_operation(kind, operation, start.elapsed().as_secs_f64(), result.is_ok());
        if let Err(e) = result {
            metrics::record_error(e.kind_label(), operation);
        }
    }

    fn decode(&self, encoded: &str) -> Result<R::Stored> {
        serde_json::from_str(encoded).map_err(|e| {
            Error::Serialization(format!("Corrupt value in collection '{}': {}", self.name, e))
        })
    }

    /// Cached values of `stamps`, positional, `None` where absent
    async fn read_values(
        &self,
        tagging: &str,
        stamps: &[Timestamp],
    ) -> Result<Vec<Option<R::Stored>>> {
        if stamps.is_empty() {
            return Ok(Vec::new());
        }
        let fields: Vec<String> = stamps.iter().map(|ts| ts.to_string()).collect();
        let raw = self
            .index
            .backend()
            .hget(&self.values_key(tagging), &fields)
            .await?;
        raw.into_iter()
            .map(|v| v.map(|encoded| self.decode(&encoded)).transpose())
            .collect()
    }

    /// Pair entries with their values, skipping keys removed mid-read
    fn render_all(
        &self,
        tagging: &str,
        entries: &[MetadataEntry],
        values: Vec<Option<R::Stored>>,
        read: &QueryOptions,
    ) -> KeyedValues {
        entries
            .iter()
            .zip(values)
            .filter_map(|(entry, value)| {
                value.map(|v| (entry_key(entry.ts, tagging), self.rule.render(v, read)))
            })
            .collect()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    async fn store_inner(
        &self,
        ts: Timestamp,
        tagging: &str,
        value: CacheValue,
        options: StoreOptions,
    ) -> Result<StoreOutcome> {
        validate_tagging(tagging)?;
        let input = self.rule.accept(value)?;
        let expire_at = options.resolve_expire(ts, self.default_expire);
        // entries past the far-future sentinel would escape full sweeps
        if expire_at > FAR_FUTURE {
            return Err(Error::Validation(format!(
                "Expiry {} of '{}' is past the latest supported time {}",
                expire_at, self.name, FAR_FUTURE
            )));
        }
        let values_key = self.values_key(tagging);

        let _guard = self.lock.lock().await;

        let ts_slice = [ts];
        let (existing, current) = futures::try_join!(
            self.index.get(tagging, ts),
            self.read_values(tagging, &ts_slice),
        )?;
        let created = existing.is_none();
        let mut stored = current.into_iter().next().flatten().unwrap_or_default();
        let written = self.rule.merge(&mut stored, input);
        self.rule.check(&stored)?;

        let mut batch = Batch::new();
        if created {
            let entry = MetadataEntry::new(ts, expire_at).with_args(options.args);
            self.index.stage_entry(&mut batch, tagging, &entry)?;
        }
        if created || written > 0 {
            batch.hset(values_key, ts.to_string(), serde_json::to_string(&stored)?);
        }
        self.index.backend().execute(batch).await?;
        drop(_guard);

        self.register_tagging(tagging);
        if created {
            metrics::record_entry_created(self.rule.kind().as_str());
            debug!(collection = %self.name, tagging, ts, expire_at, "Created entry");
        }

        Ok(StoreOutcome { created, written })
    }

    async fn query_inner(
        &self,
        start: Timestamp,
        end: Timestamp,
        tagging: &str,
        options: &QueryOptions,
    ) -> Result<KeyedValues> {
        let entries = self.index.range_by_timeline(tagging, start, end).await?;
        let stamps: Vec<Timestamp> = entries.iter().map(|e| e.ts).collect();
        let values = self.read_values(tagging, &stamps).await?;
        Ok(self.render_all(tagging, &entries, values, options))
    }

    async fn fetch_inner(&self, options: &FetchOptions) -> Result<KeyedValues> {
        let sentinel = options.effective_sentinel();
        let _guard = if options.delete {
            Some(self.lock.lock().await)
        } else {
            None
        };

        let mut results = Vec::new();
        let mut batch = Batch::new();
        let mut removed = 0;

        for tagging in self.resolve_taggings(&options.tagging) {
            let entries = self.index.range_by_expiry(&tagging, sentinel).await?;
            if entries.is_empty() {
                continue;
            }

            let stamps: Vec<Timestamp> = entries.iter().map(|e| e.ts).collect();
            let values = self.read_values(&tagging, &stamps).await?;
            results.extend(self.render_all(&tagging, &entries, values, &options.read));

            if options.delete {
                self.index.stage_removal(&mut batch, &tagging, &stamps);
                batch.hdel(
                    self.values_key(&tagging),
                    stamps.iter().map(|ts| ts.to_string()).collect(),
                );
                removed += stamps.len();
            }
        }

        // removal happens only after every tagging has been read
        if !batch.is_empty() {
            self.index.backend().execute(batch).await?;
            metrics::record_entries_removed(self.rule.kind().as_str(), "fetch", removed);
            debug!(collection = %self.name, removed, sentinel, "Fetched and removed entries");
        }

        Ok(results)
    }

    async fn delete_inner(&self, ts: Timestamp, tagging: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        if !self.index.contains(tagging, ts).await? {
            return Ok(false);
        }

        let mut batch = Batch::new();
        self.index.stage_removal(&mut batch, tagging, &[ts]);
        batch.hdel(self.values_key(tagging), vec![ts.to_string()]);
        self.index.backend().execute(batch).await?;

        metrics::record_entries_removed(self.rule.kind().as_str(), "delete", 1);
        Ok(true)
    }

    async fn pop_inner(&self, ts: Timestamp, tagging: &str, n: usize) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let current = self.read_values(tagging, &[ts]).await?;
        let exists = current.first().map_or(false, Option::is_some);
        let mut stored = current.into_iter().next().flatten().unwrap_or_default();

        // run on the empty default too, so unsupported variants still fail
        let popped = self.rule.pop(&mut stored, n)?;
        if exists && !popped.is_empty() {
            self.index
                .backend()
                .hset(&self.values_key(tagging), &ts.to_string(), &serde_json::to_string(&stored)?)
                .await?;
        }
        Ok(popped)
    }

    async fn dump_inner(&self) -> Result<DumpRecord> {
        let _guard = self.lock.lock().await;
        let mut snapshot = IndexSnapshot {
            kind: self.rule.kind(),
            default_expire: self.default_expire,
            taggings: Default::default(),
        };
        let mut values = ValueSnapshot::new();

        for tagging in self.taggings() {
            let entries = self.index.snapshot(&tagging).await?;
            let stamps: Vec<Timestamp> = entries.iter().map(|e| e.ts).collect();
            let stored = self.read_values(&tagging, &stamps).await?;
            for (ts, value) in stamps.iter().zip(stored) {
                if let Some(value) = value {
                    values.insert(entry_key(*ts, &tagging), serde_json::to_value(&value)?);
                }
            }
            snapshot.taggings.insert(tagging, entries);
        }

        Ok(DumpRecord(self.name.clone(), snapshot, values))
    }

    async fn load_inner(&self, record: DumpRecord) -> Result<bool> {
        let DumpRecord(name, snapshot, values) = record;
        if name != self.name {
            warn!(
                collection = %self.name,
                record = %name,
                "Ignoring dump record for another collection"
            );
            return Ok(false);
        }
        if snapshot.kind != self.rule.kind() {
            return Err(Error::Validation(format!(
                "Dump of '{}' holds a {} collection, not {}",
                name,
                snapshot.kind,
                self.rule.kind()
            )));
        }

        // decode everything before touching the backend
        let mut batch = Batch::new();
        for (tagging, entries) in &snapshot.taggings {
            for entry in entries {
                self.index.stage_entry(&mut batch, tagging, entry)?;
            }
        }
        for (key, value) in values {
            let (ts, tagging) = parse_entry_key(&key).ok_or_else(|| {
                Error::Serialization(format!("Invalid value key '{}' in dump of '{}'", key, name))
            })?;
            let stored: R::Stored = serde_json::from_value(value)?;
            batch.hset(self.values_key(tagging), ts.to_string(), serde_json::to_string(&stored)?);
        }

        let _guard = self.lock.lock().await;
        self.index.backend().execute(batch).await?;
        for tagging in snapshot.taggings.keys() {
            self.register_tagging(tagging);
        }

        info!(
            collection = %self.name,
            taggings = snapshot.taggings.len(),
            "Loaded collection dump"
        );
        Ok(true)
    }

    async fn clear_inner(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut batch = Batch::new();
        for tagging in self.taggings() {
            self.index.stage_clear(&mut batch, &tagging);
            batch.del(self.values_key(&tagging));
        }
        self.index.backend().execute(batch).await?;
        self.taggings.write().clear();
        Ok(())
    }
}

fn validate_tagging(tagging: &str) -> Result<()> {
    if tagging.is_empty() {
        return Err(Error::Validation("Tagging cannot be empty".to_string()));
    }
    if tagging == ALL_TAGGINGS {
        return Err(Error::Validation(format!(
            "Tagging '{}' is reserved for fetch",
            ALL_TAGGINGS
        )));
    }
    Ok(())
}

#[async_trait]
impl<R: MergeRule> Collection for TaggedCollection<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CollectionKind {
        self.rule.kind()
    }

    fn default_expire(&self) -> i64 {
        self.default_expire
    }

    fn taggings(&self) -> Vec<String> {
        self.taggings.read().iter().cloned().collect()
    }

    async fn store(
        &self,
        ts: Timestamp,
        tagging: &str,
        value: CacheValue,
        options: StoreOptions,
    ) -> Result<StoreOutcome> {
        let start = Instant::now();
        let result = self.store_inner(ts, tagging, value, options).await;
        self.observe("store", start, &result);
        result
    }

    async fn query(
        &self,
        start: Timestamp,
        end: Timestamp,
        tagging: &str,
        options: &QueryOptions,
    ) -> Result<KeyedValues> {
        let timer = Instant::now();
        let result = self.query_inner(start, end, tagging, options).await;
        self.observe("query", timer, &result);
        result
    }

    async fn fetch(&self, options: &FetchOptions) -> Result<KeyedValues> {
        let start = Instant::now();
        let result = self.fetch_inner(options).await;
        self.observe("fetch", start, &result);
        result
    }

    async fn delete(&self, ts: Timestamp, tagging: &str) -> Result<bool> {
        let start = Instant::now();
        let result = self.delete_inner(ts, tagging).await;
        self.observe("delete", start, &result);
        result
    }

    async fn pop(&self, ts: Timestamp, tagging: &str, n: usize) -> Result<Vec<String>> {
        let start = Instant::now();
        let result = self.pop_inner(ts, tagging, n).await;
        self.observe("pop", start, &result);
        result
    }

    async fn dump(&self) -> Result<DumpRecord> {
        let start = Instant::now();
        let result = self.dump_inner().await;
        self.observe("dump", start, &result);
        result
    }

    async fn load(&self, record: DumpRecord) -> Result<bool> {
        let start = Instant::now();
        let result = self.load_inner(record).await;
        self.observe("load", start, &result);
        result
    }

    async fn clear(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.clear_inner().await;
        self.observe("clear", start, &result);
        result
    }
}
