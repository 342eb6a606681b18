//! Collection engine
//!
//! A collection is a named aggregation store. Each stored value lands on a
//! `(tagging, ts)` key and is merged into what is already cached there by the
//! collection's rule:
//!
//! - [`IncreaseCollection`]: numeric fields merged with `inc`, `avg`, `max` or `min`
//! - [`UniqueCountCollection`]: member sets unioned, with cardinality reads and `pop`
//! - [`SortedCountCollection`]: member scores overwritten, with ranked `top_n` reads
//!
//! All three share one engine ([`TaggedCollection`]) and differ only in their
//! [`MergeRule`]. The first store of a key fixes its metadata (expiry and
//! extra arguments); every store merges its value.
//!
//! # Example
//!
//! ```rust
//! use rollcache::backend::MemoryBackend;
//! use rollcache::collection::Collection;
//! use rollcache::types::{CacheValue, CollectionKind, QueryOptions, StoreOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> rollcache::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let hits = CollectionKind::default().build("hits", 300, backend, "rollcache")?;
//!
//! hits.store(128, "foo", CacheValue::map([("bar", 1.0)]), StoreOptions::default()).await?;
//! hits.store(128, "foo", CacheValue::map([("bar", 1.0)]), StoreOptions::default()).await?;
//!
//! let rows = hits.query(0, 1000, "foo", &QueryOptions::default()).await?;
//! assert_eq!(rows, vec![("128:foo".to_string(), CacheValue::map([("bar", 2.0)]))]);
//! # Ok(())
//! # }
//! ```

mod tagged;
pub mod increase;
pub mod sorted;
pub mod unique;

pub use self::tagged::{MergeRule, TaggedCollection};
pub use self::increase::{IncreaseCollection, IncreaseRule};
pub use self::sorted::{SortedCountCollection, SortedRule};
pub use self::unique::{UniqueCountCollection, UniqueRule};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::index::MetadataIndex;
use crate::types::{
    CacheValue, CollectionKind, FetchOptions, MetadataEntry, QueryOptions, StoreOptions,
    StoreOutcome, Timestamp,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Keyed read results, `("{ts}:{tagging}", value)`
pub type KeyedValues = Vec<(String, CacheValue)>;

/// Cached values of a dump, keyed by `"{ts}:{tagging}"`
pub type ValueSnapshot = BTreeMap<String, serde_json::Value>;

/// Collection metadata reported by `info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Collection name
    pub name: String,
    /// Aggregation variant
    pub kind: CollectionKind,
    /// Expiry in seconds added to `ts` (or now) when a store gives none
    pub default_expire: i64,
    /// Taggings seen so far, sorted
    pub taggings: Vec<String>,
}

/// Metadata half of a dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Variant the collection was created with
    pub kind: CollectionKind,
    /// Default expiry of the collection
    pub default_expire: i64,
    /// Every metadata entry, per tagging, ascending by `ts`
    pub taggings: BTreeMap<String, Vec<MetadataEntry>>,
}

/// Persisted collection state, `[name, index snapshot, value snapshot]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpRecord(pub String, pub IndexSnapshot, pub ValueSnapshot);

impl DumpRecord {
    /// Name the record was dumped from
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Metadata snapshot
    pub fn index(&self) -> &IndexSnapshot {
        &self.1
    }

    /// Cached values
    pub fn values(&self) -> &ValueSnapshot {
        &self.2
    }
}

/// One named aggregation store
///
/// Unknown taggings and inverted ranges are empty results, never errors.
#[async_trait]
pub trait Collection: Send + Sync + 'static {
    /// Collection name
    fn name(&self) -> &str;

    /// Aggregation variant
    fn kind(&self) -> CollectionKind;

    /// Default expiry in seconds
    fn default_expire(&self) -> i64;

    /// Taggings seen so far, sorted
    fn taggings(&self) -> Vec<String>;

    /// Name, kind, taggings and default expiry
    fn info(&self) -> CollectionInfo {
        CollectionInfo {
            name: self.name().to_string(),
            kind: self.kind(),
            default_expire: self.default_expire(),
            taggings: self.taggings(),
        }
    }

    /// Merge `value` into the key `(tagging, ts)`, creating its metadata on first store
    async fn store(
        &self,
        ts: Timestamp,
        tagging: &str,
        value: CacheValue,
        options: StoreOptions,
    ) -> Result<StoreOutcome>;

    /// Values of every key with `start <= ts <= end`, ascending by `ts`
    async fn query(
        &self,
        start: Timestamp,
        end: Timestamp,
        tagging: &str,
        options: &QueryOptions,
    ) -> Result<KeyedValues>;

    /// Sweep keys by expiry, optionally removing what was read
    ///
    /// Per tagging, results are ascending by expiry. No order is guaranteed
    /// across taggings.
    async fn fetch(&self, options: &FetchOptions) -> Result<KeyedValues>;

    /// Remove one key's metadata and value; returns whether it existed
    async fn delete(&self, ts: Timestamp, tagging: &str) -> Result<bool>;

    /// Remove and return up to `n` members of a key's set, keeping its metadata
    async fn pop(&self, ts: Timestamp, tagging: &str, n: usize) -> Result<Vec<String>>;

    /// Snapshot of the full collection state
    async fn dump(&self) -> Result<DumpRecord>;

    /// Write a snapshot back
    ///
    /// A record dumped under another name is ignored and `Ok(false)` is
    /// returned without touching any state.
    async fn load(&self, record: DumpRecord) -> Result<bool>;

    /// Drop every key of the collection
    async fn clear(&self) -> Result<()>;
}

/// Reject names that would break backend keys or dump file names
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("Collection name cannot be empty".to_string()));
    }
    if let Some(c) = name.chars().find(|c| matches!(c, ':' | '.' | '/' | '\\')) {
        return Err(Error::Validation(format!(
            "Collection name '{}' contains reserved character '{}'",
            name, c
        )));
    }
    Ok(())
}

impl CollectionKind {
    /// Build an empty collection of this kind
    pub fn build(
        self,
        name: &str,
        default_expire: i64,
        backend: Arc<dyn Backend>,
        key_prefix: &str,
    ) -> Result<Arc<dyn Collection>> {
        validate_name(name)?;
        if default_expire <= 0 {
            return Err(Error::Validation(format!(
                "Default expire of '{}' must be positive, got {}",
                name, default_expire
            )));
        }

        let index = MetadataIndex::new(backend, key_prefix, name);
        let collection: Arc<dyn Collection> = match self {
            CollectionKind::Increase(aggregator) => Arc::new(TaggedCollection::new(
                name,
                default_expire,
                IncreaseRule::new(aggregator),
                index,
            )),
            CollectionKind::UniqueCount => {
                Arc::new(TaggedCollection::new(name, default_expire, UniqueRule, index))
            },
            CollectionKind::SortedCount => {
                Arc::new(TaggedCollection::new(name, default_expire, SortedRule, index))
            },
        };
        Ok(collection)
    }
}
