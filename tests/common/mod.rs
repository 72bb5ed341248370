//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use tbone::storage::{
    CollectionOptions, Document, DocumentStore, IndexSpec, LogRecord, Query, StoreError,
    StoreResult, UpdateResult,
};
use tbone::{Field, MemoryStore, Schema, StoreHandle};

/// Store that fails the next `failures` calls with a connection failure
/// before delegating to an in-memory store.
pub struct FlakyStore {
    inner: StoreHandle,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new().into_handle(),
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        })
    }

    pub fn fail_next(&self, failures: u32) {
        self.failures.store(failures, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    fn gate(&self) -> StoreResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(StoreError::ConnectionFailure(format!("connection reset on call {call}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn collection_names(&self) -> StoreResult<Vec<String>> {
        self.gate()?;
        self.inner.collection_names().await
    }

    async fn create_collection(&self, name: &str, options: &CollectionOptions) -> StoreResult<()> {
        self.gate()?;
        self.inner.create_collection(name, options).await
    }

    async fn drop_collection(&self, name: &str) -> StoreResult<bool> {
        self.gate()?;
        self.inner.drop_collection(name).await
    }

    async fn insert(&self, collection: &str, key: &str, doc: &Document) -> StoreResult<()> {
        self.gate()?;
        self.inner.insert(collection, key, doc).await
    }

    async fn upsert(&self, collection: &str, key: &str, doc: &Document) -> StoreResult<bool> {
        self.gate()?;
        self.inner.upsert(collection, key, doc).await
    }

    async fn find_one(&self, collection: &str, filter: &Document) -> StoreResult<Option<Document>> {
        self.gate()?;
        self.inner.find_one(collection, filter).await
    }

    async fn find(&self, collection: &str, query: &Query) -> StoreResult<Vec<Document>> {
        self.gate()?;
        self.inner.find(collection, query).await
    }

    async fn count(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        self.gate()?;
        self.inner.count(collection, filter).await
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Document,
    ) -> StoreResult<Vec<JsonValue>> {
        self.gate()?;
        self.inner.distinct(collection, field, filter).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        return_after: bool,
    ) -> StoreResult<Option<Document>> {
        self.gate()?;
        self.inner
            .find_one_and_update(collection, filter, update, return_after)
            .await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<UpdateResult> {
        self.gate()?;
        self.inner.update_one(collection, filter, update).await
    }

    async fn remove(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        self.gate()?;
        self.inner.remove(collection, filter).await
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<()> {
        self.gate()?;
        self.inner.create_index(collection, index).await
    }

    async fn append(&self, log: &str, doc: &Document) -> StoreResult<u64> {
        self.gate()?;
        self.inner.append(log, doc).await
    }

    async fn latest_position(&self, log: &str) -> StoreResult<u64> {
        self.gate()?;
        self.inner.latest_position(log).await
    }

    async fn tail_next(
        &self,
        log: &str,
        after: u64,
        max_wait: Duration,
    ) -> StoreResult<Option<LogRecord>> {
        self.gate()?;
        self.inner.tail_next(log, after, max_wait).await
    }
}

pub fn book_schema() -> Arc<Schema> {
    Schema::builder("Book")
        .field("isbn", Field::string().primary_key())
        .field("title", Field::string().required())
        .field("author", Field::string())
        .field("pages", Field::integer().min(1.0))
        .build()
        .unwrap()
}

pub fn book_data(isbn: &str, title: &str) -> JsonValue {
    json!({"isbn": isbn, "title": title, "author": "Anon", "pages": 120})
}

pub fn doc(value: JsonValue) -> Document {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}
