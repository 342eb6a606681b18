//! rollcache - tagged, time-indexed aggregation cache
//!
//! Clients push small numeric or set-valued updates keyed by
//! `(timestamp, tagging)` into named collections. Each collection merges
//! updates in place with its aggregation rule, keeps a timeline and an expiry
//! ordering of what it holds, and serves range queries and expiry sweeps.
//!
//! - [`collection`]: increase, unique-count and sorted-count collections
//! - [`index`]: per-tagging timeline and expiry orderings
//! - [`backend`]: sorted-set and hash store (in memory or Redis)
//! - [`registry`]: name to collection mapping with dump and restore
//! - [`worker`]: request dispatch for the command layer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod collection;
pub mod error;
pub mod index;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Collection registry with dump persistence
pub mod registry;

/// Request/response command layer
pub mod worker;

// Re-export main types
pub use collection::{Collection, CollectionInfo, DumpRecord};
pub use error::{Error, Result};
pub use registry::CollectionRegistry;
pub use types::{CacheValue, CollectionKind, FetchOptions, QueryOptions, StoreOptions, Timestamp};
