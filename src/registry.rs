//! Collection registry
//!
//! Maps collection names to live collections. The registry is an explicit
//! context object: build it once at startup, call [`CollectionRegistry::restore`]
//! to reload dumps, pass it to the command layer, and call
//! [`CollectionRegistry::dump_all`] on shutdown.
//!
//! # Dump Files
//!
//! ```text
//! {dump_dir}/{kind}.{name}.dump   → JSON [name, index snapshot, value snapshot]
//! ```
//!
//! Files are written to `{file}.tmp` and renamed into place.

use crate::backend::Backend;
use crate::collection::{self, Collection, CollectionInfo, DumpRecord};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::CollectionKind;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const DUMP_EXTENSION: &str = "dump";
const DEFAULT_KEY_PREFIX: &str = "rollcache";
const DEFAULT_EXPIRE_SECS: i64 = 300;

/// A dump file found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpFile {
    /// Collection kind encoded in the file name
    pub kind: CollectionKind,
    /// Collection name encoded in the file name
    pub name: String,
    /// Full path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

/// Name to collection mapping with dump persistence
pub struct CollectionRegistry {
    backend: Arc<dyn Backend>,
    dump_dir: PathBuf,
    key_prefix: String,
    default_expire: i64,
    collections: RwLock<BTreeMap<String, Arc<dyn Collection>>>,
}

impl CollectionRegistry {
    /// Create an empty registry writing dumps under `dump_dir`
    pub fn new(backend: Arc<dyn Backend>, dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            dump_dir: dump_dir.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_expire: DEFAULT_EXPIRE_SECS,
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a registry from the storage and collection sections of `config`
    pub fn from_config(backend: Arc<dyn Backend>, config: &Config) -> Self {
        Self::new(backend, config.storage.dump_dir.clone())
            .with_key_prefix(config.collections.key_prefix.clone())
            .with_default_expire(config.collections.default_expire_secs)
    }

    /// Set the prefix of every backend key
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the expiry used when `ensure` is given none
    pub fn with_default_expire(mut self, secs: i64) -> Self {
        self.default_expire = secs;
        self
    }

    /// Directory holding dump files
    pub fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }

    /// Backend shared by every collection
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Return the named collection, creating it if absent
    ///
    /// An existing collection of a different kind is a validation error. An
    /// existing collection keeps its original expiry.
    pub fn ensure(
        &self,
        name: &str,
        kind: CollectionKind,
        default_expire: Option<i64>,
    ) -> Result<Arc<dyn Collection>> {
        if let Some(existing) = self.get(name) {
            return check_kind(existing, kind);
        }

        let mut collections = self.collections.write();
        // another caller may have created it between the two locks
        if let Some(existing) = collections.get(name) {
            return check_kind(existing.clone(), kind);
        }

        let expire = default_expire.unwrap_or(self.default_expire);
        let created = kind.build(name, expire, self.backend.clone(), &self.key_prefix)?;
        collections.insert(name.to_string(), created.clone());
        metrics::update_collections(collections.len());
        info!(collection = name, %kind, default_expire = expire, "Created collection");
        Ok(created)
    }

    /// Named collection, if registered
    pub fn get(&self, name: &str) -> Option<Arc<dyn Collection>> {
        self.collections.read().get(name).cloned()
    }

    /// Named collection, or [`Error::CollectionNotFound`]
    pub fn require(&self, name: &str) -> Result<Arc<dyn Collection>> {
        self.get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Number of registered collections
    pub fn len(&self) -> usize {
        self.collections.read().len()
    }

    /// Whether no collection is registered
    pub fn is_empty(&self) -> bool {
        self.collections.read().is_empty()
    }

    /// Info of every collection, sorted by name
    pub fn info(&self) -> Vec<CollectionInfo> {
        self.snapshot().iter().map(|c| c.info()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Collection>> {
        self.collections.read().values().cloned().collect()
    }

    /// Unregister a collection, deleting its backend keys and dump file
    ///
    /// Returns whether it existed.
    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        // unregister first so no store can reach it while it is cleared
        let (collection, remaining) = {
            let mut collections = self.collections.write();
            let Some(collection) = collections.remove(name) else {
                return Ok(false);
            };
            (collection, collections.len())
        };
        metrics::update_collections(remaining);

        collection.clear().await?;

        let path = self.dump_path(collection.kind(), name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Removed dump file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }

        info!(collection = name, "Dropped collection");
        Ok(true)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Path of the dump file of a collection
    pub fn dump_path(&self, kind: CollectionKind, name: &str) -> PathBuf {
        self.dump_dir
            .join(format!("{}.{}.{}", kind, name, DUMP_EXTENSION))
    }

    /// Dump one collection to its file
    pub async fn dump_collection(&self, collection: &dyn Collection) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dump_dir).await?;

        let record = collection.dump().await?;
        let encoded = serde_json::to_vec(&record)?;

        let path = self.dump_path(collection.kind(), collection.name());
        let tmp = path.with_extension(format!("{}.tmp", DUMP_EXTENSION));
        tokio::fs::write(&tmp, &encoded).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            collection = collection.name(),
            path = %path.display(),
            bytes = encoded.len(),
            "Dumped collection"
        );
        Ok(path)
    }

    /// Dump every collection, returning how many were written
    ///
    /// Stops at the first failure.
    pub async fn dump_all(&self) -> Result<usize> {
        let collections = self.snapshot();
        for collection in &collections {
            self.dump_collection(collection.as_ref()).await?;
        }
        info!(
            count = collections.len(),
            dir = %self.dump_dir.display(),
            "Dumped collections"
        );
        Ok(collections.len())
    }

    /// Rebuild collections from the dump directory
    ///
    /// A missing directory restores nothing. Unreadable or mismatched files
    /// are logged and skipped. Returns how many collections were loaded.
    pub async fn restore(&self) -> Result<usize> {
        if !tokio::fs::try_exists(&self.dump_dir).await? {
            info!(dir = %self.dump_dir.display(), "Dump directory missing, nothing to restore");
            return Ok(0);
        }

        let mut restored = 0;
        for file in list_dumps(&self.dump_dir)? {
            match self.restore_file(&file).await {
                Ok(true) => restored += 1,
                Ok(false) => {},
                Err(e) => error!(path = %file.path.display(), "Failed to restore dump: {}", e),
            }
        }

        info!(restored, dir = %self.dump_dir.display(), "Restored collections");
        Ok(restored)
    }

    async fn restore_file(&self, file: &DumpFile) -> Result<bool> {
        let bytes = tokio::fs::read(&file.path).await?;
        let record: DumpRecord = serde_json::from_slice(&bytes)?;

        if record.name() != file.name {
            warn!(
                path = %file.path.display(),
                record = record.name(),
                "Dump file holds another collection, skipping"
            );
            return Ok(false);
        }
        if record.index().kind != file.kind {
            return Err(Error::Validation(format!(
                "Dump of '{}' holds a {} collection, file name says {}",
                file.name,
                record.index().kind,
                file.kind
            )));
        }

        let collection = self.ensure(
            &file.name,
            file.kind,
            Some(record.index().default_expire),
        )?;
        collection.load(record).await
    }
}

fn check_kind(existing: Arc<dyn Collection>, kind: CollectionKind) -> Result<Arc<dyn Collection>> {
    if existing.kind() != kind {
        return Err(Error::Validation(format!(
            "Collection '{}' already exists as {}, not {}",
            existing.name(),
            existing.kind(),
            kind
        )));
    }
    Ok(existing)
}

/// Parse `{kind}.{name}.dump`
fn parse_dump_name(file_name: &str) -> Option<(CollectionKind, &str)> {
    let stem = file_name.strip_suffix(".dump")?;
    let (kind, name) = stem.split_once('.')?;
    collection::validate_name(name).ok()?;
    Some((kind.parse().ok()?, name))
}

/// Dump files in `dir`, sorted by name
pub fn list_dumps(dir: &Path) -> Result<Vec<DumpFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some((kind, name)) = parse_dump_name(file_name) else {
            continue;
        };
        files.push(DumpFile {
            kind,
            name: name.to_string(),
            path: entry.path(),
            size: entry.metadata()?.len(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::types::{Aggregator, CacheValue, QueryOptions, StoreOptions};

    fn registry(dir: &Path) -> CollectionRegistry {
        CollectionRegistry::new(Arc::new(MemoryBackend::new()), dir)
    }

    #[test]
    fn test_parse_dump_name() {
        assert_eq!(
            parse_dump_name("inc.hits.dump"),
            Some((CollectionKind::Increase(Aggregator::Inc), "hits"))
        );
        assert_eq!(
            parse_dump_name("sorted.top_pages.dump"),
            Some((CollectionKind::SortedCount, "top_pages"))
        );
        assert_eq!(parse_dump_name("hits.dump"), None);
        assert_eq!(parse_dump_name("bogus.hits.dump"), None);
        assert_eq!(parse_dump_name("inc.hits.dump.tmp"), None);
        assert_eq!(parse_dump_name("inc.a.b.dump"), None);
    }

    #[test]
    fn test_ensure_create_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        let a = reg.ensure("hits", CollectionKind::default(), None).unwrap();
        let b = reg.ensure("hits", CollectionKind::default(), Some(10)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.default_expire(), DEFAULT_EXPIRE_SECS);
        assert_eq!(reg.names(), vec!["hits".to_string()]);
    }

    #[test]
    fn test_ensure_conflicting_kind() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.ensure("hits", CollectionKind::default(), None).unwrap();

        let err = reg
            .ensure("hits", CollectionKind::UniqueCount, None)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_require_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(matches!(
            reg.require("nope").err(),
            Some(Error::CollectionNotFound(_))
        ));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_dump_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let hits = reg
            .ensure("hits", CollectionKind::default(), Some(60))
            .unwrap();
        hits.store(1, "a", CacheValue::map([("x", 2.0)]), StoreOptions::default())
            .await
            .unwrap();

        assert_eq!(reg.dump_all().await.unwrap(), 1);
        assert!(dir.path().join("inc.hits.dump").exists());
        assert!(!dir.path().join("inc.hits.dump.tmp").exists());

        // fresh process: new backend, same directory
        let restored = registry(dir.path());
        assert_eq!(restored.restore().await.unwrap(), 1);

        let hits = restored.require("hits").unwrap();
        assert_eq!(hits.default_expire(), 60);
        assert_eq!(hits.taggings(), vec!["a".to_string()]);
        let rows = hits.query(0, 10, "a", &QueryOptions::default()).await.unwrap();
        assert_eq!(rows, vec![("1:a".to_string(), CacheValue::map([("x", 2.0)]))]);
    }

    #[tokio::test]
    async fn test_restore_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir.path().join("absent"));
        assert_eq!(reg.restore().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_restore_skips_mismatched_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let hits = reg.ensure("hits", CollectionKind::default(), None).unwrap();
        let record = hits.dump().await.unwrap();

        // a record for "hits" saved under another name
        std::fs::write(
            dir.path().join("inc.other.dump"),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("inc.broken.dump"), b"not json").unwrap();

        let fresh = registry(dir.path());
        assert_eq!(fresh.restore().await.unwrap(), 0);
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn test_drop_collection() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let reg = CollectionRegistry::new(backend.clone(), dir.path());
        let users = reg.ensure("users", CollectionKind::UniqueCount, None).unwrap();
        users
            .store(1, "d", CacheValue::set(["a"]), StoreOptions::default())
            .await
            .unwrap();
        reg.dump_all().await.unwrap();

        assert!(reg.drop_collection("users").await.unwrap());
        assert!(!reg.drop_collection("users").await.unwrap());
        assert_eq!(backend.key_count(), 0);
        assert!(!dir.path().join("unique.users.dump").exists());
        assert!(reg.get("users").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drop_during_stores_then_recreate() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(registry(dir.path()));
        reg.ensure("hits", CollectionKind::default(), None).unwrap();

        // stores look the collection up per call, like the worker does
        let writer = {
            let reg = reg.clone();
            tokio::spawn(async move {
                let mut stored = 0;
                for ts in 0..200 {
                    let Some(c) = reg.get("hits") else { break };
                    c.store(ts, "t", CacheValue::map([("n", 1.0)]), StoreOptions::default())
                        .await
                        .unwrap();
                    stored += 1;
                    tokio::task::yield_now().await;
                }
                stored
            })
        };
        tokio::task::yield_now().await;
        assert!(reg.drop_collection("hits").await.unwrap());
        let stored = writer.await.unwrap();
        assert!(stored <= 200);

        // once dropped, lookups miss and a new collection starts clean
        assert!(reg.get("hits").is_none());
        let fresh = reg.ensure("hits", CollectionKind::default(), None).unwrap();
        assert!(fresh.taggings().is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_list_dumps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("unique.b.dump"), b"[]").unwrap();
        std::fs::write(dir.path().join("max.a.dump"), b"[]").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let files = list_dumps(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(files[0].kind, CollectionKind::Increase(Aggregator::Max));
        assert_eq!(files[1].size, 2);
    }
}
