//! Increase collection: numeric fields merged per key
//!
//! A stored map is merged field by field into the cached map using the
//! collection's [`Aggregator`]. New fields are seeded with the incoming value.

use super::{MergeRule, TaggedCollection};
use crate::error::{Error, Result};
use crate::index::MetadataIndex;
use crate::types::{Aggregator, CacheValue, CollectionKind, QueryOptions};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Increase collection with a fixed aggregator
pub type IncreaseCollection = TaggedCollection<IncreaseRule>;

/// Field-wise numeric merge
#[derive(Debug, Clone, Copy)]
pub struct IncreaseRule {
    aggregator: Aggregator,
}

impl IncreaseRule {
    /// Merge with `aggregator`
    pub fn new(aggregator: Aggregator) -> Self {
        Self { aggregator }
    }

    /// Merge function of this rule
    pub fn aggregator(&self) -> Aggregator {
        self.aggregator
    }
}

impl MergeRule for IncreaseRule {
    type Stored = BTreeMap<String, f64>;
    type Input = BTreeMap<String, f64>;

    fn kind(&self) -> CollectionKind {
        CollectionKind::Increase(self.aggregator)
    }

    fn accept(&self, value: CacheValue) -> Result<Self::Input> {
        match value {
            CacheValue::Map(fields) => {
                if let Some((field, v)) = fields.iter().find(|(_, v)| !v.is_finite()) {
                    return Err(Error::Validation(format!(
                        "Field '{}' has non-finite value {}",
                        field, v
                    )));
                }
                Ok(fields)
            },
            other => Err(Error::Validation(format!(
                "{} collections store a map of numbers, got a {}",
                self.aggregator.as_str(),
                other.shape()
            ))),
        }
    }

    fn merge(&self, stored: &mut Self::Stored, input: Self::Input) -> usize {
        let written = input.len();
        for (field, incoming) in input {
            match stored.entry(field) {
                Entry::Vacant(slot) => {
                    slot.insert(incoming);
                },
                Entry::Occupied(mut slot) => {
                    let merged = self.aggregator.merge(*slot.get(), incoming);
                    slot.insert(merged);
                },
            }
        }
        written
    }

    fn render(&self, stored: Self::Stored, _read: &QueryOptions) -> CacheValue {
        CacheValue::Map(stored)
    }

    /// Finite inputs can still overflow once merged
    fn check(&self, stored: &Self::Stored) -> Result<()> {
        match stored.iter().find(|(_, v)| !v.is_finite()) {
            Some((field, v)) => Err(Error::Validation(format!(
                "Field '{}' would overflow to {} under {}",
                field,
                v,
                self.aggregator.as_str()
            ))),
            None => Ok(()),
        }
    }
}

impl IncreaseCollection {
    /// Create an empty increase collection over `index`
    pub fn increase(
        name: &str,
        aggregator: Aggregator,
        default_expire: i64,
        index: MetadataIndex,
    ) -> Self {
        TaggedCollection::new(name, default_expire, IncreaseRule::new(aggregator), index)
    }
}
