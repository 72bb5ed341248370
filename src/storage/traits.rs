//! Abstract document store contract.
//!
//! Collections and channels only talk to storage through `DocumentStore`.
//! The trait covers plain document collections (keyed documents, equality
//! filters, secondary indexes, update operators) and capped logs that keep
//! a bounded, append-only window of entries and can be tailed.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// A stored document: an ordered JSON object.
pub type Document = serde_json::Map<String, JsonValue>;

/// Result type for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached. Transient.
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// A unique key or index already holds this value.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Collection already exists.
    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    /// Collection not found.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// An index with the same name already exists.
    #[error("Index already exists: {0}")]
    IndexExists(String),

    /// Log operation on a collection that is not capped.
    #[error("Collection is not capped: {0}")]
    NotCapped(String),

    /// Malformed update document.
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns true if the call may succeed when repeated.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailure(_))
    }
}

/// Sort direction for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// Secondary index declaration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexSpec {
    name: Option<String>,
    keys: Vec<(String, SortOrder)>,
    unique: bool,
    sparse: bool,
    ttl: Option<Duration>,
    partial_filter: Option<Document>,
}

impl IndexSpec {
    /// Index over the given keys, in order.
    #[must_use]
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = (K, SortOrder)>,
        K: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(|(k, o)| (k.into(), o)).collect(),
            ..Self::default()
        }
    }

    /// Ascending index over a single key.
    #[must_use]
    pub fn ascending(key: impl Into<String>) -> Self {
        Self::new([(key, SortOrder::Ascending)])
    }

    /// Overrides the generated index name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Rejects a second document with the same key values.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Skip documents missing any indexed key.
    #[must_use]
    pub const fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Expire documents after `ttl`. Recorded for the backend; the in-memory
    /// store does not expire documents.
    #[must_use]
    pub const fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Only index documents matching `filter`.
    #[must_use]
    pub fn partial(mut self, filter: Document) -> Self {
        self.partial_filter = Some(filter);
        self
    }

    /// Explicit name, or the key names joined by underscores.
    #[must_use]
    pub fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.keys
                .iter()
                .map(|(k, _)| k.as_str())
                .collect::<Vec<_>>()
                .join("_")
        })
    }

    /// Indexed keys and their directions.
    #[must_use]
    pub fn keys(&self) -> &[(String, SortOrder)] {
        &self.keys
    }

    /// Whether the index rejects duplicates.
    #[must_use]
    pub const fn is_unique(&self) -> bool {
        self.unique
    }

    /// Whether documents missing the keys are skipped.
    #[must_use]
    pub const fn is_sparse(&self) -> bool {
        self.sparse
    }

    /// Expiry age, if declared.
    #[must_use]
    pub const fn ttl_duration(&self) -> Option<Duration> {
        self.ttl
    }

    /// Filter limiting the indexed documents, if declared.
    #[must_use]
    pub const fn partial_filter(&self) -> Option<&Document> {
        self.partial_filter.as_ref()
    }
}

/// Size limits of a capped log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CappedOptions {
    /// Most entries kept.
    pub max_documents: usize,
    /// Most bytes kept.
    pub max_bytes: usize,
}

/// Options used when explicitly creating a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionOptions {
    /// Limits of a capped log; `None` for a plain collection.
    pub capped: Option<CappedOptions>,
}

impl CollectionOptions {
    /// Options of a capped log.
    #[must_use]
    pub const fn capped(max_documents: usize, max_bytes: usize) -> Self {
        Self {
            capped: Some(CappedOptions {
                max_documents,
                max_bytes,
            }),
        }
    }
}

/// Find request: equality filter, projection, ordering and pagination.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    /// Equality filter with optional comparison operators.
    pub filter: Document,
    /// Top-level keys kept in results; `None` keeps all.
    pub projection: Option<Vec<String>>,
    /// Sort keys applied in order.
    pub sort: Vec<(String, SortOrder)>,
    /// Documents skipped before the first result.
    pub skip: usize,
    /// Most documents returned.
    pub limit: Option<usize>,
}

impl Query {
    /// Query matching everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches documents whose values equal every entry of `filter`.
    #[must_use]
    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = filter;
        self
    }

    /// Keep only these top-level keys in returned documents.
    #[must_use]
    pub fn projection<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.projection = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a sort key.
    #[must_use]
    pub fn sort(mut self, key: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((key.into(), order));
        self
    }

    /// Skips the first `skip` matches.
    #[must_use]
    pub const fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Returns at most `limit` documents.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Counts reported by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateResult {
    /// Documents matching the filter.
    pub matched: u64,
    /// Documents actually changed.
    pub modified: u64,
}

/// An entry read from a capped log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Monotonic position; later appends always get larger positions.
    pub position: u64,
    /// The stored entry.
    pub document: Document,
}

/// Async document store.
///
/// # Safety Considerations
/// - Single-document writes must be atomic
/// - Implementations must handle concurrent access safely
/// - Writes to a missing collection create it implicitly
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Names of all existing collections.
    async fn collection_names(&self) -> StoreResult<Vec<String>>;

    /// Create a collection explicitly. Errors if it exists.
    async fn create_collection(&self, name: &str, options: &CollectionOptions) -> StoreResult<()>;

    /// Drop a collection. Returns whether it existed.
    async fn drop_collection(&self, name: &str) -> StoreResult<bool>;

    /// Insert a document. Errors if a document with the same `key` value exists.
    async fn insert(&self, collection: &str, key: &str, doc: &Document) -> StoreResult<()>;

    /// Insert or replace the document identified by its `key` value.
    /// Returns true when a new document was inserted.
    async fn upsert(&self, collection: &str, key: &str, doc: &Document) -> StoreResult<bool>;

    /// First document matching `filter`.
    async fn find_one(&self, collection: &str, filter: &Document) -> StoreResult<Option<Document>>;

    /// Documents matching `query`.
    async fn find(&self, collection: &str, query: &Query) -> StoreResult<Vec<Document>>;

    /// Number of documents matching `filter`.
    async fn count(&self, collection: &str, filter: &Document) -> StoreResult<u64>;

    /// Distinct values of `field` among matching documents, in first-seen order.
    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Document,
    ) -> StoreResult<Vec<JsonValue>>;

    /// Apply `update` to the first matching document and return it, either as
    /// it was before the update or after it.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        return_after: bool,
    ) -> StoreResult<Option<Document>>;

    /// Apply `update` to the first matching document.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<UpdateResult>;

    /// Remove all matching documents. Returns the number removed.
    async fn remove(&self, collection: &str, filter: &Document) -> StoreResult<u64>;

    /// Create a secondary index. Errors if an index with the same name exists.
    async fn create_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<()>;

    /// Append an entry to a capped log, evicting the oldest entries past its
    /// limits. Returns the entry's position.
    async fn append(&self, log: &str, doc: &Document) -> StoreResult<u64>;

    /// Position of the newest entry in a capped log, or 0 when empty.
    async fn latest_position(&self, log: &str) -> StoreResult<u64>;

    /// First entry positioned after `after`, waiting up to `max_wait` for one
    /// to be appended. Returns `None` on timeout.
    async fn tail_next(
        &self,
        log: &str,
        after: u64,
        max_wait: Duration,
    ) -> StoreResult<Option<LogRecord>>;
}
