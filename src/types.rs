//! Core data types used throughout the cache
//!
//! # Key Types
//!
//! - **`Timestamp`**: logical time of a cached bucket (integer seconds)
//! - **`CollectionKind`**: which aggregation rule a collection applies
//! - **`CacheValue`**: the payload crossing the collection boundary
//! - **`MetadataEntry`**: one indexed `(ts, expire_at)` point of a tagging
//! - **`StoreOptions`**, **`QueryOptions`**, **`FetchOptions`**: per-call knobs
//!
//! # Example
//!
//! ```rust
//! use rollcache::types::{Aggregator, CollectionKind};
//!
//! let kind: CollectionKind = "max".parse().unwrap();
//! assert_eq!(kind, CollectionKind::Increase(Aggregator::Max));
//! assert_eq!(kind.to_string(), "max");
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Logical timestamp of a cached bucket, in seconds
pub type Timestamp = i64;

/// Reserved tagging name meaning "every known tagging" in fetch requests
pub const ALL_TAGGINGS: &str = "__all__";

/// Expiry sentinel that matches every entry regardless of expiry
///
/// 2075-01-01T00:00:00Z. Used for dumps and non-expired fetches.
pub const FAR_FUTURE: Timestamp = 3_313_526_400;

/// Current wall-clock time in seconds
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Build the public key of a cached value, `"{ts}:{tagging}"`
pub fn entry_key(ts: Timestamp, tagging: &str) -> String {
    format!("{}:{}", ts, tagging)
}

/// Split a `"{ts}:{tagging}"` key back into its parts
pub fn parse_entry_key(key: &str) -> Option<(Timestamp, &str)> {
    let (ts, tagging) = key.split_once(':')?;
    Some((ts.parse().ok()?, tagging))
}

// =============================================================================
// Collection kinds
// =============================================================================

/// Merge function of an Increase Collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    /// Sum of all stored values
    Inc,
    /// Average of the incoming value and the previous accumulator
    ///
    /// Not a running mean: every merge averages with the immediately
    /// preceding accumulated value only.
    Avg,
    /// Largest value seen
    Max,
    /// Smallest value seen
    Min,
}

impl Aggregator {
    /// Merge `incoming` into `current`
    #[inline]
    pub fn merge(self, current: f64, incoming: f64) -> f64 {
        match self {
            Aggregator::Inc => current + incoming,
            Aggregator::Avg => (current + incoming) / 2.0,
            Aggregator::Max => current.max(incoming),
            Aggregator::Min => current.min(incoming),
        }
    }

    /// Name used in configuration, dumps and the command layer
    pub fn as_str(self) -> &'static str {
        match self {
            Aggregator::Inc => "inc",
            Aggregator::Avg => "avg",
            Aggregator::Max => "max",
            Aggregator::Min => "min",
        }
    }
}

/// Aggregation variant of a collection
///
/// Selects the concrete [`Collection`](crate::collection::Collection)
/// implementation built by [`CollectionKind::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    /// Scalar field merge with the given function
    Increase(Aggregator),
    /// De-duplicated member sets
    UniqueCount,
    /// Member to score maps with ranked retrieval
    SortedCount,
}

impl Default for CollectionKind {
    fn default() -> Self {
        CollectionKind::Increase(Aggregator::Inc)
    }
}

impl CollectionKind {
    /// Name used in configuration, dumps, metrics and the command layer
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionKind::Increase(agg) => agg.as_str(),
            CollectionKind::UniqueCount => "unique",
            CollectionKind::SortedCount => "sorted",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inc" => Ok(CollectionKind::Increase(Aggregator::Inc)),
            "avg" => Ok(CollectionKind::Increase(Aggregator::Avg)),
            "max" => Ok(CollectionKind::Increase(Aggregator::Max)),
            "min" => Ok(CollectionKind::Increase(Aggregator::Min)),
            "unique" => Ok(CollectionKind::UniqueCount),
            "sorted" => Ok(CollectionKind::SortedCount),
            other => Err(Error::Validation(format!(
                "Unknown collection kind '{}' (expected inc, avg, max, min, unique or sorted)",
                other
            ))),
        }
    }
}

impl Serialize for CollectionKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CollectionKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Values
// =============================================================================

/// Payload stored into or read out of a collection
///
/// Stores accept `Map` (Increase and Sorted-Count) or `Set` (Unique-Count).
/// Reads return `Map`, `Set`, `Ranked` (ascending by score) or `Count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheValue {
    /// Field or member name to number
    Map(BTreeMap<String, f64>),
    /// De-duplicated members
    Set(BTreeSet<String>),
    /// Member/score pairs, ascending by score
    Ranked(Vec<(String, f64)>),
    /// Cardinality of a set
    Count(u64),
}

impl CacheValue {
    /// Short shape name used in validation messages
    pub fn shape(&self) -> &'static str {
        match self {
            CacheValue::Map(_) => "map",
            CacheValue::Set(_) => "set",
            CacheValue::Ranked(_) => "ranked list",
            CacheValue::Count(_) => "count",
        }
    }

    /// Build a `Map` value from pairs
    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, f64)>) -> Self {
        CacheValue::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a `Set` value from members
    pub fn set<K: Into<String>>(members: impl IntoIterator<Item = K>) -> Self {
        CacheValue::Set(members.into_iter().map(Into::into).collect())
    }
}

/// One point of the metadata index
///
/// `expire_at` and `args` are fixed by the first store of a `(tagging, ts)`
/// pair and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Logical time of the bucket
    pub ts: Timestamp,
    /// Absolute expiry time
    pub expire_at: Timestamp,
    /// Opaque caller bookkeeping carried through unchanged
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl MetadataEntry {
    /// Create an entry without extra arguments
    pub fn new(ts: Timestamp, expire_at: Timestamp) -> Self {
        Self {
            ts,
            expire_at,
            args: Vec::new(),
        }
    }

    /// Attach extra arguments
    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }
}

// =============================================================================
// Per-call options
// =============================================================================

/// What `default_expire` is added to when no explicit expiry is given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireBase {
    /// `ts + default_expire`
    #[default]
    EventTime,
    /// `now + default_expire`
    WallClock,
}

/// Options for a store call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Absolute expiry time overriding the collection default
    #[serde(default)]
    pub expire_at: Option<Timestamp>,
    /// Base used when `expire_at` is not set
    #[serde(default)]
    pub relative_to: ExpireBase,
    /// Extra arguments recorded with a newly created metadata entry
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl StoreOptions {
    /// Use an absolute expiry time
    pub fn expire_at(mut self, ts: Timestamp) -> Self {
        self.expire_at = Some(ts);
        self
    }

    /// Compute expiry from wall-clock time instead of event time
    pub fn wall_clock(mut self) -> Self {
        self.relative_to = ExpireBase::WallClock;
        self
    }

    /// Attach extra metadata arguments
    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    /// Resolve the expiry time of a store at `ts`
    pub fn resolve_expire(&self, ts: Timestamp, default_expire: i64) -> Timestamp {
        match (self.expire_at, self.relative_to) {
            (Some(at), _) => at,
            (None, ExpireBase::EventTime) => ts.saturating_add(default_expire),
            (None, ExpireBase::WallClock) => now().saturating_add(default_expire),
        }
    }
}

/// Result of a store call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    /// Whether this store created the metadata entry
    pub created: bool,
    /// Fields merged, new members added or members written
    pub written: usize,
}

/// Read shaping shared by query and fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Sorted-Count only: keep the N highest-scored members
    #[serde(default)]
    pub top_n: Option<usize>,
    /// Unique-Count only: return cardinalities instead of sets
    #[serde(default)]
    pub count_only: bool,
}

impl QueryOptions {
    /// Keep only the top `n` members
    pub fn top(n: usize) -> Self {
        Self {
            top_n: Some(n),
            count_only: false,
        }
    }

    /// Return cardinalities only
    pub fn counts() -> Self {
        Self {
            top_n: None,
            count_only: true,
        }
    }
}

/// Options for a fetch call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Tagging to sweep, or [`ALL_TAGGINGS`]
    #[serde(default = "default_fetch_tagging")]
    pub tagging: String,
    /// Remove matched entries and values after reading them
    #[serde(default = "default_true")]
    pub delete: bool,
    /// Only match entries whose expiry is at or before the sentinel
    #[serde(default = "default_true")]
    pub expired_only: bool,
    /// Expiry sentinel; defaults to now
    #[serde(default)]
    pub sentinel: Option<Timestamp>,
    /// Read shaping applied per key
    #[serde(flatten)]
    pub read: QueryOptions,
}

fn default_fetch_tagging() -> String {
    ALL_TAGGINGS.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            tagging: default_fetch_tagging(),
            delete: true,
            expired_only: true,
            sentinel: None,
            read: QueryOptions::default(),
        }
    }
}

impl FetchOptions {
    /// Create options with the defaults (all taggings, delete, expired only)
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one tagging
    pub fn tagging(mut self, tagging: impl Into<String>) -> Self {
        self.tagging = tagging.into();
        self
    }

    /// Keep matched data in place
    pub fn keep(mut self) -> Self {
        self.delete = false;
        self
    }

    /// Match every entry regardless of expiry
    pub fn everything(mut self) -> Self {
        self.expired_only = false;
        self
    }

    /// Match entries expired at `sentinel`
    pub fn expired_at(mut self, sentinel: Timestamp) -> Self {
        self.expired_only = true;
        self.sentinel = Some(sentinel);
        self
    }

    /// Keep the N highest-scored members per key
    pub fn top(mut self, n: usize) -> Self {
        self.read.top_n = Some(n);
        self
    }

    /// Return cardinalities only
    pub fn counts(mut self) -> Self {
        self.read.count_only = true;
        self
    }

    /// The expiry sentinel actually used for the sweep
    pub fn effective_sentinel(&self) -> Timestamp {
        if self.expired_only {
            self.sentinel.unwrap_or_else(now)
        } else {
            FAR_FUTURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregator_merge() {
        assert_eq!(Aggregator::Inc.merge(1.0, 2.0), 3.0);
        assert_eq!(Aggregator::Avg.merge(1.0, 3.0), 2.0);
        assert_eq!(Aggregator::Max.merge(1.0, 3.0), 3.0);
        assert_eq!(Aggregator::Min.merge(1.0, 3.0), 1.0);
    }

    #[test]
    fn test_avg_is_pairwise() {
        // seed 10, then 20 -> 15, then 0 -> 7.5 (not the running mean 10)
        let mut acc = 10.0;
        acc = Aggregator::Avg.merge(acc, 20.0);
        acc = Aggregator::Avg.merge(acc, 0.0);
        assert_eq!(acc, 7.5);
    }

    #[test]
    fn test_kind_parse_roundtrip() {
        for name in ["inc", "avg", "max", "min", "unique", "sorted"] {
            let kind: CollectionKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
        assert!("IncreaseCollection".parse::<CollectionKind>().is_err());
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&CollectionKind::SortedCount).unwrap();
        assert_eq!(json, "\"sorted\"");
        let kind: CollectionKind = serde_json::from_str("\"avg\"").unwrap();
        assert_eq!(kind, CollectionKind::Increase(Aggregator::Avg));
    }

    #[test]
    fn test_cache_value_untagged() {
        let map: CacheValue = serde_json::from_str(r#"{"bar": 1, "apple": 2.5}"#).unwrap();
        assert_eq!(map, CacheValue::map([("bar", 1.0), ("apple", 2.5)]));

        let set: CacheValue = serde_json::from_str(r#"["a", "b", "a"]"#).unwrap();
        assert_eq!(set, CacheValue::set(["a", "b"]));

        let ranked = CacheValue::Ranked(vec![("x".into(), 1.0)]);
        assert_eq!(serde_json::to_string(&ranked).unwrap(), r#"[["x",1.0]]"#);
    }

    #[test]
    fn test_resolve_expire() {
        let opts = StoreOptions::default();
        assert_eq!(opts.resolve_expire(100, 300), 400);

        let opts = StoreOptions::default().expire_at(42);
        assert_eq!(opts.resolve_expire(100, 300), 42);

        let opts = StoreOptions::default().wall_clock();
        let before = now();
        let at = opts.resolve_expire(100, 300);
        assert!(at >= before + 300);
    }

    #[test]
    fn test_fetch_defaults() {
        let opts = FetchOptions::new();
        assert_eq!(opts.tagging, ALL_TAGGINGS);
        assert!(opts.delete);
        assert!(opts.expired_only);

        let opts: FetchOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts, FetchOptions::default());
    }

    #[test]
    fn test_effective_sentinel() {
        assert_eq!(FetchOptions::new().everything().effective_sentinel(), FAR_FUTURE);
        assert_eq!(FetchOptions::new().expired_at(77).effective_sentinel(), 77);
    }

    #[test]
    fn test_far_future_is_2075() {
        let dt = chrono::DateTime::from_timestamp(FAR_FUTURE, 0).unwrap();
        assert_eq!(dt.to_rfc3339(), "2075-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_entry_key() {
        assert_eq!(entry_key(128, "foo"), "128:foo");
        assert_eq!(entry_key(-5, "a"), "-5:a");
        assert_eq!(parse_entry_key("128:foo:bar"), Some((128, "foo:bar")));
        assert_eq!(parse_entry_key("nope"), None);
        assert_eq!(parse_entry_key("x:foo"), None);
    }
}
