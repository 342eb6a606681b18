//! Command layer
//!
//! Decodes [`Request`]s into registry and collection calls and encodes the
//! outcome as a [`Response`]. Transport is left to the caller; the bundled
//! server carries requests as JSON over HTTP.
//!
//! # Example
//!
//! ```rust
//! use rollcache::backend::MemoryBackend;
//! use rollcache::registry::CollectionRegistry;
//! use rollcache::worker::{Request, Status, Worker};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let registry = Arc::new(CollectionRegistry::new(Arc::new(MemoryBackend::new()), "/tmp/dumps"));
//! let worker = Worker::new(registry);
//!
//! let request: Request = serde_json::from_str(
//!     r#"{"command": "store", "collection": "hits", "ts": 128, "tagging": "foo", "value": {"bar": 1}}"#,
//! ).unwrap();
//! let response = worker.handle(request).await;
//! assert_eq!(response.status, Status::Ok);
//! # }
//! ```

use crate::error::{Error, Result};
use crate::metrics;
use crate::registry::CollectionRegistry;
use crate::types::{
    CacheValue, CollectionKind, FetchOptions, QueryOptions, StoreOptions, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// A command addressed to the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Liveness probe
    Ping,

    /// Dump every collection to the dump directory
    Dump,

    /// Create a collection unless it exists
    EnsureCollection {
        /// Collection name
        collection: String,
        /// Aggregation variant, `inc` when absent
        #[serde(default)]
        kind: CollectionKind,
        /// Default expiry in seconds; the registry default when absent
        #[serde(default)]
        expire: Option<i64>,
    },

    /// Store a value, creating the collection if needed
    Store {
        /// Collection name
        collection: String,
        /// Bucket timestamp
        ts: Timestamp,
        /// Tagging
        tagging: String,
        /// Value to merge
        value: CacheValue,
        /// Kind used if the collection has to be created
        #[serde(default)]
        kind: Option<CollectionKind>,
        /// Expiry and metadata arguments
        #[serde(default)]
        options: StoreOptions,
    },

    /// Read a timeline range of one tagging
    Query {
        /// Collection name
        collection: String,
        /// First timestamp, inclusive
        start: Timestamp,
        /// Last timestamp, inclusive
        end: Timestamp,
        /// Tagging
        tagging: String,
        /// Read shaping
        #[serde(default)]
        options: QueryOptions,
    },

    /// Sweep expired (or all) keys
    Fetch {
        /// Collection name
        collection: String,
        /// Tagging, sentinel and deletion switches
        #[serde(default)]
        options: FetchOptions,
    },

    /// Remove up to `count` members from a unique-count key
    Pop {
        /// Collection name
        collection: String,
        /// Bucket timestamp
        ts: Timestamp,
        /// Tagging
        tagging: String,
        /// Maximum members to remove
        count: usize,
    },

    /// Remove one key
    Delete {
        /// Collection name
        collection: String,
        /// Bucket timestamp
        ts: Timestamp,
        /// Tagging
        tagging: String,
    },

    /// Name, kind, taggings and expiry of one collection
    CollectionInfo {
        /// Collection name
        collection: String,
    },

    /// Names of every collection
    Collections,

    /// Delete a collection with its data and dump file
    DropCollection {
        /// Collection name
        collection: String,
    },
}

impl Request {
    /// Command name, used for logs and metrics
    pub fn command(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Dump => "dump",
            Request::EnsureCollection { .. } => "ensure_collection",
            Request::Store { .. } => "store",
            Request::Query { .. } => "query",
            Request::Fetch { .. } => "fetch",
            Request::Pop { .. } => "pop",
            Request::Delete { .. } => "delete",
            Request::CollectionInfo { .. } => "collection_info",
            Request::Collections => "collections",
            Request::DropCollection { .. } => "drop_collection",
        }
    }
}

/// Outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Completed
    Ok,
    /// Failed; see `error`
    Error,
}

/// Failure details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error class (`validation`, `backend`, `not_found`, ...)
    pub kind: String,
    /// Human readable message
    pub message: String,
}

/// Reply to a [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Whether the request succeeded
    pub status: Status,
    /// Result payload
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Failure details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Successful response carrying `data`
    pub fn ok(data: Value) -> Self {
        Self {
            status: Status::Ok,
            data,
            error: None,
        }
    }

    /// Failed response built from `err`
    pub fn error(err: &Error) -> Self {
        Self {
            status: Status::Error,
            data: Value::Null,
            error: Some(ErrorBody {
                kind: err.kind_label().to_string(),
                message: err.to_string(),
            }),
        }
    }

    /// Whether the request succeeded
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Dispatches requests against a registry
#[derive(Clone)]
pub struct Worker {
    registry: Arc<CollectionRegistry>,
}

impl Worker {
    /// Create a worker over `registry`
    pub fn new(registry: Arc<CollectionRegistry>) -> Self {
        Self { registry }
    }

    /// Registry the worker dispatches to
    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }

    /// Run one request; failures become error responses
    pub async fn handle(&self, request: Request) -> Response {
        let command = request.command();
        match self.dispatch(request).await {
            Ok(data) => {
                debug!(command, "Request handled");
                Response::ok(data)
            },
            Err(e) => {
                warn!(command, error = %e, "Request failed");
                metrics::record_error(e.kind_label(), command);
                Response::error(&e)
            },
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value> {
        match request {
            Request::Ping => Ok(json!("pong")),

            Request::Dump => {
                let count = self.registry.dump_all().await?;
                Ok(json!({ "dumped": count }))
            },

            Request::EnsureCollection {
                collection,
                kind,
                expire,
            } => {
                let c = self.registry.ensure(&collection, kind, expire)?;
                Ok(serde_json::to_value(c.info())?)
            },

            Request::Store {
                collection,
                ts,
                tagging,
                value,
                kind,
                options,
            } => {
                let c = match self.registry.get(&collection) {
                    Some(c) => c,
                    None => self
                        .registry
                        .ensure(&collection, kind.unwrap_or_default(), None)?,
                };
                let outcome = c.store(ts, &tagging, value, options).await?;
                Ok(serde_json::to_value(outcome)?)
            },

            Request::Query {
                collection,
                start,
                end,
                tagging,
                options,
            } => {
                let c = self.registry.require(&collection)?;
                let rows = c.query(start, end, &tagging, &options).await?;
                Ok(serde_json::to_value(rows)?)
            },

            Request::Fetch {
                collection,
                options,
            } => {
                let c = self.registry.require(&collection)?;
                let rows = c.fetch(&options).await?;
                Ok(serde_json::to_value(rows)?)
            },

            Request::Pop {
                collection,
                ts,
                tagging,
                count,
            } => {
                let c = self.registry.require(&collection)?;
                Ok(serde_json::to_value(c.pop(ts, &tagging, count).await?)?)
            },

            Request::Delete {
                collection,
                ts,
                tagging,
            } => {
                let c = self.registry.require(&collection)?;
                Ok(json!({ "deleted": c.delete(ts, &tagging).await? }))
            },

            Request::CollectionInfo { collection } => {
                let c = self.registry.require(&collection)?;
                Ok(serde_json::to_value(c.info())?)
            },

            Request::Collections => Ok(serde_json::to_value(self.registry.names())?),

            Request::DropCollection { collection } => {
                let dropped = self.registry.drop_collection(&collection).await?;
                Ok(json!({ "dropped": dropped }))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn worker() -> (tempfile::TempDir, Worker) {
        let dir = tempfile::tempdir().unwrap();
        let registry = CollectionRegistry::new(Arc::new(MemoryBackend::new()), dir.path());
        (dir, Worker::new(Arc::new(registry)))
    }

    fn parse(json: &str) -> Request {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let req = parse(r#"{"command": "ping"}"#);
        assert_eq!(req, Request::Ping);

        let req = parse(
            r#"{"command": "fetch", "collection": "hits", "options": {"tagging": "foo", "delete": false}}"#,
        );
        let Request::Fetch { options, .. } = req else {
            panic!("expected fetch");
        };
        assert_eq!(options.tagging, "foo");
        assert!(!options.delete);
        assert!(options.expired_only);

        let req = parse(r#"{"command": "ensure_collection", "collection": "u", "kind": "unique"}"#);
        assert_eq!(req.command(), "ensure_collection");
    }

    #[test]
    fn test_error_response_shape() {
        let resp = Response::error(&Error::CollectionNotFound("x".into()));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["kind"], "not_found");
        assert!(json.get("data").is_none());
    }

    #[tokio::test]
    async fn test_ping() {
        let (_dir, worker) = worker();
        let resp = worker.handle(Request::Ping).await;
        assert_eq!(resp, Response::ok(json!("pong")));
    }

    #[tokio::test]
    async fn test_store_creates_inc_collection() {
        let (_dir, worker) = worker();
        let resp = worker
            .handle(parse(
                r#"{"command": "store", "collection": "hits", "ts": 123, "tagging": "www", "value": {"test": 1}}"#,
            ))
            .await;
        assert!(resp.is_ok());
        assert_eq!(resp.data["created"], true);

        let info = worker
            .handle(Request::CollectionInfo {
                collection: "hits".into(),
            })
            .await;
        assert_eq!(info.data["kind"], "inc");
        assert_eq!(info.data["taggings"], json!(["www"]));

        let rows = worker
            .handle(parse(
                r#"{"command": "query", "collection": "hits", "start": 10, "end": 1000, "tagging": "www"}"#,
            ))
            .await;
        assert_eq!(rows.data, json!([["123:www", {"test": 1.0}]]));
    }

    #[tokio::test]
    async fn test_query_unknown_collection() {
        let (_dir, worker) = worker();
        let resp = worker
            .handle(parse(
                r#"{"command": "query", "collection": "nope", "start": 0, "end": 1, "tagging": "t"}"#,
            ))
            .await;
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.error.unwrap().kind, "not_found");
    }

    #[tokio::test]
    async fn test_validation_error_is_reported() {
        let (_dir, worker) = worker();
        let resp = worker
            .handle(parse(
                r#"{"command": "store", "collection": "hits", "ts": 1, "tagging": "t", "value": ["a"]}"#,
            ))
            .await;
        assert_eq!(resp.error.unwrap().kind, "validation");
    }

    #[tokio::test]
    async fn test_collections_and_drop() {
        let (_dir, worker) = worker();
        for name in ["b", "a"] {
            worker
                .handle(Request::EnsureCollection {
                    collection: name.into(),
                    kind: CollectionKind::SortedCount,
                    expire: Some(60),
                })
                .await;
        }
        let resp = worker.handle(Request::Collections).await;
        assert_eq!(resp.data, json!(["a", "b"]));

        let resp = worker
            .handle(Request::DropCollection {
                collection: "a".into(),
            })
            .await;
        assert_eq!(resp.data["dropped"], true);
        let resp = worker.handle(Request::Collections).await;
        assert_eq!(resp.data, json!(["b"]));
    }
}
