//! Unique-count collection: de-duplicated member sets per key

use super::{MergeRule, TaggedCollection};
use crate::error::{Error, Result};
use crate::index::MetadataIndex;
use crate::types::{CacheValue, CollectionKind, QueryOptions};
use std::collections::BTreeSet;

/// Collection of member sets
pub type UniqueCountCollection = TaggedCollection<UniqueRule>;

/// Set union; `count_only` reads return cardinalities
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueRule;

impl MergeRule for UniqueRule {
    type Stored = BTreeSet<String>;
    type Input = BTreeSet<String>;

    fn kind(&self) -> CollectionKind {
        CollectionKind::UniqueCount
    }

    fn accept(&self, value: CacheValue) -> Result<Self::Input> {
        match value {
            CacheValue::Set(members) => Ok(members),
            other => Err(Error::Validation(format!(
                "unique collections store a set of members, got a {}",
                other.shape()
            ))),
        }
    }

    /// Returns the number of members not already present
    fn merge(&self, stored: &mut Self::Stored, input: Self::Input) -> usize {
        input
            .into_iter()
            .filter(|member| stored.insert(member.clone()))
            .count()
    }

    fn render(&self, stored: Self::Stored, read: &QueryOptions) -> CacheValue {
        if read.count_only {
            CacheValue::Count(stored.len() as u64)
        } else {
            CacheValue::Set(stored)
        }
    }

    /// Takes the first `n` members in sort order
    fn pop(&self, stored: &mut Self::Stored, n: usize) -> Result<Vec<String>> {
        let mut popped = Vec::with_capacity(n.min(stored.len()));
        while popped.len() < n {
            match stored.pop_first() {
                Some(member) => popped.push(member),
                None => break,
            }
        }
        Ok(popped)
    }
}

impl UniqueCountCollection {
    /// Create an empty unique-count collection over `index`
    pub fn unique(name: &str, default_expire: i64, index: MetadataIndex) -> Self {
        TaggedCollection::new(name, default_expire, UniqueRule, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::collection::Collection;
    use crate::types::{FetchOptions, StoreOptions};
    use std::sync::Arc;

    fn collection() -> UniqueCountCollection {
        let backend = Arc::new(MemoryBackend::new());
        UniqueCountCollection::unique("users", 300, MetadataIndex::new(backend, "t", "users"))
    }

    #[tokio::test]
    async fn test_store_counts_new_members() {
        let c = collection();
        let first = c
            .store(100, "d", CacheValue::set(["a", "b"]), StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(first.written, 2);
        assert!(first.created);

        let second = c
            .store(100, "d", CacheValue::set(["b", "c"]), StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(second.written, 1);
        assert!(!second.created);

        let rows = c.query(0, 200, "d", &QueryOptions::default()).await.unwrap();
        assert_eq!(rows, vec![("100:d".to_string(), CacheValue::set(["a", "b", "c"]))]);
    }

    #[tokio::test]
    async fn test_all_duplicates_writes_nothing() {
        let c = collection();
        c.store(1, "d", CacheValue::set(["a"]), StoreOptions::default())
            .await
            .unwrap();
        let again = c
            .store(1, "d", CacheValue::set(["a"]), StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(again.written, 0);
    }

    #[tokio::test]
    async fn test_count_only() {
        let c = collection();
        c.store(1, "d", CacheValue::set(["a", "b", "c"]), StoreOptions::default())
            .await
            .unwrap();

        let rows = c.query(0, 10, "d", &QueryOptions::counts()).await.unwrap();
        assert_eq!(rows[0].1, CacheValue::Count(3));

        let rows = c
            .fetch(&FetchOptions::new().everything().keep().counts())
            .await
            .unwrap();
        assert_eq!(rows[0].1, CacheValue::Count(3));
    }

    #[tokio::test]
    async fn test_pop_shrinks_set_but_keeps_metadata() {
        let c = collection();
        c.store(7, "d", CacheValue::set(["x", "y", "z"]), StoreOptions::default())
            .await
            .unwrap();

        let popped = c.pop(7, "d", 2).await.unwrap();
        assert_eq!(popped, vec!["x".to_string(), "y".to_string()]);

        let rows = c.query(7, 7, "d", &QueryOptions::default()).await.unwrap();
        assert_eq!(rows[0].1, CacheValue::set(["z"]));

        // over-asking drains the set; the key stays
        let popped = c.pop(7, "d", 10).await.unwrap();
        assert_eq!(popped, vec!["z".to_string()]);
        let rows = c.query(7, 7, "d", &QueryOptions::default()).await.unwrap();
        assert_eq!(rows, vec![("7:d".to_string(), CacheValue::Set(BTreeSet::new()))]);
        assert!(c.index().contains("d", 7).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_key() {
        let c = collection();
        c.store(7, "d", CacheValue::set(["x"]), StoreOptions::default())
            .await
            .unwrap();
        assert!(c.delete(7, "d").await.unwrap());
        assert!(c.query(0, 10, "d", &QueryOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_map() {
        let c = collection();
        let err = c
            .store(1, "d", CacheValue::map([("a", 1.0)]), StoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
