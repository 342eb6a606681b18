//! Sorted-count collection: member scores per key with ranked reads
//!
//! Stores overwrite member scores (last write wins per member). Reads return
//! members ascending by score; `top_n` keeps only the N highest-scored ones,
//! still ascending. Ties are ordered by member name.

use super::{MergeRule, TaggedCollection};
use crate::error::{Error, Result};
use crate::index::MetadataIndex;
use crate::types::{CacheValue, CollectionKind, QueryOptions};
use std::collections::BTreeMap;

/// Collection of member/score maps
pub type SortedCountCollection = TaggedCollection<SortedRule>;

/// Per-member overwrite with ranked rendering
#[derive(Debug, Clone, Copy, Default)]
pub struct SortedRule;

impl MergeRule for SortedRule {
    type Stored = BTreeMap<String, f64>;
    type Input = Vec<(String, f64)>;

    fn kind(&self) -> CollectionKind {
        CollectionKind::SortedCount
    }

    fn accept(&self, value: CacheValue) -> Result<Self::Input> {
        let pairs: Vec<(String, f64)> = match value {
            CacheValue::Map(scores) => scores.into_iter().collect(),
            CacheValue::Ranked(pairs) => pairs,
            other => {
                return Err(Error::Validation(format!(
                    "sorted collections store member scores, got a {}",
                    other.shape()
                )))
            },
        };
        if let Some((member, score)) = pairs.iter().find(|(_, s)| !s.is_finite()) {
            return Err(Error::Validation(format!(
                "Member '{}' has non-finite score {}",
                member, score
            )));
        }
        Ok(pairs)
    }

    fn merge(&self, stored: &mut Self::Stored, input: Self::Input) -> usize {
        let written = input.len();
        stored.extend(input);
        written
    }

    fn render(&self, stored: Self::Stored, read: &QueryOptions) -> CacheValue {
        CacheValue::Ranked(rank(stored, read.top_n))
    }
}

/// Members ascending by score, truncated to the `top_n` highest
pub fn rank(scores: BTreeMap<String, f64>, top_n: Option<usize>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    if let Some(n) = top_n {
        let skip = ranked.len().saturating_sub(n);
        ranked.drain(..skip);
    }
    ranked
}

impl SortedCountCollection {
    /// Create an empty sorted-count collection over `index`
    pub fn sorted(name: &str, default_expire: i64, index: MetadataIndex) -> Self {
        TaggedCollection::new(name, default_expire, SortedRule, index)
    }
}
