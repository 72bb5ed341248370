//! In-memory document store.
//!
//! Thread-safe implementation of `DocumentStore` for embedded usage, tests,
//! and as a reference for what backends must honor: key and unique-index
//! enforcement, update operators, and capped logs with monotonic positions
//! that can be tailed.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::storage::traits::{
    CappedOptions, CollectionOptions, Document, DocumentStore, IndexSpec, LogRecord, Query,
    SortOrder, StoreError, StoreResult, UpdateResult,
};
use crate::storage::StoreHandle;

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

fn capped_err(name: &str) -> StoreError {
    StoreError::Backend(format!("'{name}' is a capped log; use append"))
}

/// Looks up a possibly dotted path.
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a JsonValue> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

const fn type_rank(value: &JsonValue) -> u8 {
    match value {
        JsonValue::Null => 0,
        JsonValue::Number(_) => 1,
        JsonValue::String(_) => 2,
        JsonValue::Object(_) => 3,
        JsonValue::Array(_) => 4,
        JsonValue::Bool(_) => 5,
    }
}

/// Total order over JSON values: by type first, then by value.
pub(crate) fn compare_json(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        (JsonValue::Array(x), JsonValue::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| compare_json(l, r))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (JsonValue::Object(x), JsonValue::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn is_operator_object(value: &JsonValue) -> bool {
    value
        .as_object()
        .is_some_and(|ops| !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')))
}

fn matches_value(actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
    if is_operator_object(expected) {
        if let JsonValue::Object(ops) = expected {
            return ops.iter().all(|(op, arg)| matches_operator(actual, op, arg));
        }
    }
    match actual {
        None => expected.is_null(),
        Some(JsonValue::Array(items)) if !expected.is_array() => items.contains(expected),
        Some(value) => value == expected,
    }
}

fn matches_operator(actual: Option<&JsonValue>, op: &str, arg: &JsonValue) -> bool {
    let ordered = |accept: fn(Ordering) -> bool| {
        actual.is_some_and(|v| type_rank(v) == type_rank(arg) && accept(compare_json(v, arg)))
    };
    match op {
        "$eq" => matches_value(actual, arg),
        "$ne" => !matches_value(actual, arg),
        "$in" => arg
            .as_array()
            .is_some_and(|items| items.iter().any(|item| matches_value(actual, item))),
        "$nin" => arg
            .as_array()
            .is_some_and(|items| !items.iter().any(|item| matches_value(actual, item))),
        "$exists" => actual.is_some() == arg.as_bool().unwrap_or(true),
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        _ => false,
    }
}

/// True when every filter entry matches the document.
pub(crate) fn matches(doc: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(path, expected)| matches_value(lookup(doc, path), expected))
}

fn project(doc: &Document, keys: Option<&[String]>) -> Document {
    match keys {
        None => doc.clone(),
        Some(keys) => doc
            .iter()
            .filter(|(k, _)| keys.iter().any(|key| key == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn add_numbers(current: &JsonValue, delta: &JsonValue) -> Option<JsonValue> {
    let (JsonValue::Number(a), JsonValue::Number(b)) = (current, delta) else {
        return None;
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(JsonValue::from(sum));
        }
    }
    let sum = a.as_f64()? + b.as_f64()?;
    serde_json::Number::from_f64(sum).map(JsonValue::Number)
}

/// Applies update operators to a copy of `doc`.
fn apply_update(doc: &Document, update: &Document) -> StoreResult<Document> {
    let mut out = doc.clone();
    for (op, args) in update {
        let JsonValue::Object(args) = args else {
            return Err(StoreError::InvalidUpdate(format!("'{op}' expects a mapping")));
        };
        match op.as_str() {
            "$set" => {
                for (k, v) in args {
                    out.insert(k.clone(), v.clone());
                }
            }
            "$unset" => {
                for k in args.keys() {
                    out.shift_remove(k);
                }
            }
            "$inc" => {
                for (k, delta) in args {
                    let next = match out.get(k) {
                        None => delta.is_number().then(|| delta.clone()),
                        Some(current) => add_numbers(current, delta),
                    }
                    .ok_or_else(|| StoreError::InvalidUpdate(format!("cannot increment '{k}'")))?;
                    out.insert(k.clone(), next);
                }
            }
            "$push" => {
                for (k, item) in args {
                    match out.get_mut(k) {
                        None => {
                            out.insert(k.clone(), JsonValue::Array(vec![item.clone()]));
                        }
                        Some(JsonValue::Array(items)) => items.push(item.clone()),
                        Some(_) => {
                            return Err(StoreError::InvalidUpdate(format!(
                                "cannot push to non-array '{k}'"
                            )));
                        }
                    }
                }
            }
            other if other.starts_with('$') => {
                return Err(StoreError::InvalidUpdate(format!(
                    "unsupported operator '{other}'"
                )));
            }
            other => {
                return Err(StoreError::InvalidUpdate(format!(
                    "replacement documents are not supported (found key '{other}')"
                )));
            }
        }
    }
    Ok(out)
}

fn index_key(index: &IndexSpec, doc: &Document) -> Option<Vec<JsonValue>> {
    if let Some(filter) = index.partial_filter() {
        if !matches(doc, filter) {
            return None;
        }
    }
    let values: Vec<Option<&JsonValue>> = index.keys().iter().map(|(k, _)| lookup(doc, k)).collect();
    if index.is_sparse() && values.iter().all(|v| v.map_or(true, JsonValue::is_null)) {
        return None;
    }
    Some(values.into_iter().map(|v| v.cloned().unwrap_or(JsonValue::Null)).collect())
}

#[derive(Debug)]
struct CappedLog {
    options: CappedOptions,
    entries: VecDeque<(LogRecord, usize)>,
    bytes: usize,
    last_position: u64,
    notify: Arc<Notify>,
}

impl CappedLog {
    fn new(options: CappedOptions) -> Self {
        Self {
            options,
            entries: VecDeque::new(),
            bytes: 0,
            last_position: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, name: &str, doc: &Document) -> StoreResult<u64> {
        let size = serde_json::to_vec(doc)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .len();
        if size > self.options.max_bytes {
            return Err(StoreError::Backend(format!(
                "entry of {size} bytes exceeds the byte budget of '{name}'"
            )));
        }
        self.last_position += 1;
        self.entries.push_back((
            LogRecord {
                position: self.last_position,
                document: doc.clone(),
            },
            size,
        ));
        self.bytes += size;
        while self.entries.len() > self.options.max_documents || self.bytes > self.options.max_bytes {
            match self.entries.pop_front() {
                Some((_, evicted)) => self.bytes -= evicted,
                None => break,
            }
        }
        self.notify.notify_waiters();
        Ok(self.last_position)
    }

    fn next_after(&self, after: u64) -> Option<LogRecord> {
        self.entries
            .iter()
            .find(|(record, _)| record.position > after)
            .map(|(record, _)| record.clone())
    }
}

#[derive(Debug, Default)]
struct CollectionState {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
    log: Option<CappedLog>,
}

impl CollectionState {
    fn documents(&self) -> Box<dyn Iterator<Item = &Document> + '_> {
        match &self.log {
            Some(log) => Box::new(log.entries.iter().map(|(record, _)| &record.document)),
            None => Box::new(self.docs.iter()),
        }
    }

    fn position_of_key(&self, key: &str, value: &JsonValue) -> Option<usize> {
        self.docs.iter().position(|d| d.get(key) == Some(value))
    }

    fn check_unique(&self, candidate: &Document, skip: Option<usize>) -> StoreResult<()> {
        for index in self.indexes.iter().filter(|i| i.is_unique()) {
            let Some(key) = index_key(index, candidate) else {
                continue;
            };
            let clash = self
                .docs
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != skip)
                .any(|(_, other)| index_key(index, other).as_ref() == Some(&key));
            if clash {
                return Err(StoreError::DuplicateKey(format!(
                    "index '{}' already holds {}",
                    index.resolved_name(),
                    JsonValue::Array(key)
                )));
            }
        }
        Ok(())
    }

    fn writable(&mut self, name: &str) -> StoreResult<&mut Self> {
        if self.log.is_some() {
            return Err(capped_err(name));
        }
        Ok(self)
    }
}

/// Thread-safe in-memory document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, CollectionState>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the store into a shareable handle.
    #[must_use]
    pub fn into_handle(self) -> StoreHandle {
        Arc::new(self)
    }

    fn read<T>(
        &self,
        collection: &str,
        context: &'static str,
        f: impl FnOnce(Option<&CollectionState>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let collections = self.collections.read().map_err(|_| lock_err(context))?;
        f(collections.get(collection))
    }

    fn write<T>(
        &self,
        collection: &str,
        context: &'static str,
        f: impl FnOnce(&mut CollectionState) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut collections = self.collections.write().map_err(|_| lock_err(context))?;
        f(collections.entry(collection.to_string()).or_default())
    }

    fn log_notify(&self, log: &str) -> StoreResult<Arc<Notify>> {
        self.read(log, "log_notify", |state| {
            let state = state.ok_or_else(|| StoreError::CollectionNotFound(log.to_string()))?;
            let capped = state
                .log
                .as_ref()
                .ok_or_else(|| StoreError::NotCapped(log.to_string()))?;
            Ok(Arc::clone(&capped.notify))
        })
    }

    fn next_entry(&self, log: &str, after: u64) -> StoreResult<Option<LogRecord>> {
        self.read(log, "next_entry", |state| {
            let state = state.ok_or_else(|| StoreError::CollectionNotFound(log.to_string()))?;
            let capped = state
                .log
                .as_ref()
                .ok_or_else(|| StoreError::NotCapped(log.to_string()))?;
            Ok(capped.next_after(after))
        })
    }

    fn update_first(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<Option<(Document, Document)>> {
        self.write(collection, "update_first", |state| {
            let state = state.writable(collection)?;
            let Some(pos) = state.docs.iter().position(|d| matches(d, filter)) else {
                return Ok(None);
            };
            let before = state.docs[pos].clone();
            let after = apply_update(&before, update)?;
            state.check_unique(&after, Some(pos))?;
            state.docs[pos] = after.clone();
            Ok(Some((before, after)))
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn collection_names(&self) -> StoreResult<Vec<String>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| lock_err("collection_names"))?;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, name: &str, options: &CollectionOptions) -> StoreResult<()> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| lock_err("create_collection"))?;
        if collections.contains_key(name) {
            return Err(StoreError::CollectionExists(name.to_string()));
        }
        let state = CollectionState {
            log: options.capped.map(CappedLog::new),
            ..CollectionState::default()
        };
        collections.insert(name.to_string(), state);
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> StoreResult<bool> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| lock_err("drop_collection"))?;
        Ok(collections.remove(name).is_some())
    }

    async fn insert(&self, collection: &str, key: &str, doc: &Document) -> StoreResult<()> {
        let value = doc
            .get(key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| StoreError::Backend(format!("document has no '{key}' value")))?;
        self.write(collection, "insert", |state| {
            let state = state.writable(collection)?;
            if state.position_of_key(key, value).is_some() {
                return Err(StoreError::DuplicateKey(format!("{key}: {value}")));
            }
            state.check_unique(doc, None)?;
            state.docs.push(doc.clone());
            Ok(())
        })
    }

    async fn upsert(&self, collection: &str, key: &str, doc: &Document) -> StoreResult<bool> {
        let value = doc
            .get(key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| StoreError::Backend(format!("document has no '{key}' value")))?;
        self.write(collection, "upsert", |state| {
            let state = state.writable(collection)?;
            let existing = state.position_of_key(key, value);
            state.check_unique(doc, existing)?;
            match existing {
                Some(pos) => {
                    state.docs[pos] = doc.clone();
                    Ok(false)
                }
                None => {
                    state.docs.push(doc.clone());
                    Ok(true)
                }
            }
        })
    }

    async fn find_one(&self, collection: &str, filter: &Document) -> StoreResult<Option<Document>> {
        self.read(collection, "find_one", |state| {
            Ok(state.and_then(|s| s.documents().find(|d| matches(d, filter)).cloned()))
        })
    }

    async fn find(&self, collection: &str, query: &Query) -> StoreResult<Vec<Document>> {
        self.read(collection, "find", |state| {
            let Some(state) = state else {
                return Ok(Vec::new());
            };
            let mut docs: Vec<&Document> = state
                .documents()
                .filter(|d| matches(d, &query.filter))
                .collect();
            if !query.sort.is_empty() {
                docs.sort_by(|a, b| {
                    query
                        .sort
                        .iter()
                        .map(|(key, order)| {
                            let null = JsonValue::Null;
                            let ord = compare_json(
                                lookup(a, key).unwrap_or(&null),
                                lookup(b, key).unwrap_or(&null),
                            );
                            match order {
                                SortOrder::Ascending => ord,
                                SortOrder::Descending => ord.reverse(),
                            }
                        })
                        .find(|o| *o != Ordering::Equal)
                        .unwrap_or(Ordering::Equal)
                });
            }
            Ok(docs
                .into_iter()
                .skip(query.skip)
                .take(query.limit.unwrap_or(usize::MAX))
                .map(|d| project(d, query.projection.as_deref()))
                .collect())
        })
    }

    async fn count(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        self.read(collection, "count", |state| {
            let n = state.map_or(0, |s| s.documents().filter(|d| matches(d, filter)).count());
            Ok(n as u64)
        })
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Document,
    ) -> StoreResult<Vec<JsonValue>> {
        self.read(collection, "distinct", |state| {
            let mut seen: Vec<JsonValue> = Vec::new();
            let Some(state) = state else {
                return Ok(seen);
            };
            for doc in state.documents().filter(|d| matches(d, filter)) {
                let values = match lookup(doc, field) {
                    None => continue,
                    Some(JsonValue::Array(items)) => items.clone(),
                    Some(value) => vec![value.clone()],
                };
                for value in values {
                    if !seen.contains(&value) {
                        seen.push(value);
                    }
                }
            }
            Ok(seen)
        })
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        return_after: bool,
    ) -> StoreResult<Option<Document>> {
        Ok(self
            .update_first(collection, filter, update)?
            .map(|(before, after)| if return_after { after } else { before }))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<UpdateResult> {
        Ok(match self.update_first(collection, filter, update)? {
            None => UpdateResult::default(),
            Some((before, after)) => UpdateResult {
                matched: 1,
                modified: u64::from(before != after),
            },
        })
    }

    async fn remove(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        self.write(collection, "remove", |state| {
            let state = state.writable(collection)?;
            let before = state.docs.len();
            state.docs.retain(|d| !matches(d, filter));
            Ok((before - state.docs.len()) as u64)
        })
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<()> {
        self.write(collection, "create_index", |state| {
            let name = index.resolved_name();
            if state.indexes.iter().any(|i| i.resolved_name() == name) {
                return Err(StoreError::IndexExists(name));
            }
            if index.is_unique() {
                let mut keys: Vec<Vec<JsonValue>> = Vec::new();
                for key in state.docs.iter().filter_map(|d| index_key(index, d)) {
                    if keys.contains(&key) {
                        return Err(StoreError::DuplicateKey(format!(
                            "index '{name}' cannot be built: {} occurs more than once",
                            JsonValue::Array(key)
                        )));
                    }
                    keys.push(key);
                }
            }
            state.indexes.push(index.clone());
            Ok(())
        })
    }

    async fn append(&self, log: &str, doc: &Document) -> StoreResult<u64> {
        let mut collections = self.collections.write().map_err(|_| lock_err("append"))?;
        let state = collections
            .get_mut(log)
            .ok_or_else(|| StoreError::CollectionNotFound(log.to_string()))?;
        let capped = state
            .log
            .as_mut()
            .ok_or_else(|| StoreError::NotCapped(log.to_string()))?;
        capped.push(log, doc)
    }

    async fn latest_position(&self, log: &str) -> StoreResult<u64> {
        self.read(log, "latest_position", |state| {
            let state = state.ok_or_else(|| StoreError::CollectionNotFound(log.to_string()))?;
            state
                .log
                .as_ref()
                .map(|capped| capped.last_position)
                .ok_or_else(|| StoreError::NotCapped(log.to_string()))
        })
    }

    async fn tail_next(
        &self,
        log: &str,
        after: u64,
        max_wait: Duration,
    ) -> StoreResult<Option<LogRecord>> {
        let deadline = Instant::now() + max_wait;
        let notify = self.log_notify(log)?;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(record) = self.next_entry(log, after)? {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_key() {
        let store = MemoryStore::new();
        store.insert("hats", "_id", &doc(json!({"_id": 1, "name": "fedora"}))).await.unwrap();
        let err = store
            .insert("hats", "_id", &doc(json!({"_id": 1, "name": "beret"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
        assert_eq!(store.count("hats", &Document::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing() {
        let store = MemoryStore::new();
        assert!(store.upsert("hats", "_id", &doc(json!({"_id": 1, "size": 5}))).await.unwrap());
        assert!(!store.upsert("hats", "_id", &doc(json!({"_id": 1, "size": 7}))).await.unwrap());

        let found = store.find_one("hats", &doc(json!({"_id": 1}))).await.unwrap().unwrap();
        assert_eq!(found["size"], json!(7));
    }

    #[tokio::test]
    async fn test_find_sort_skip_limit() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store
                .insert("items", "_id", &doc(json!({"_id": i, "rank": 10 - i, "kind": i % 2})))
                .await
                .unwrap();
        }

        let query = Query::new()
            .filter(doc(json!({"kind": 0})))
            .sort("rank", SortOrder::Ascending)
            .skip(1)
            .limit(2)
            .projection(["_id"]);
        let found = store.find("items", &query).await.unwrap();
        assert_eq!(found, vec![doc(json!({"_id": 6})), doc(json!({"_id": 4}))]);
    }

    #[tokio::test]
    async fn test_filter_operators() {
        let store = MemoryStore::new();
        for (id, price) in [(1, 5), (2, 15), (3, 25)] {
            store
                .insert("items", "_id", &doc(json!({"_id": id, "price": price, "tags": ["a"]})))
                .await
                .unwrap();
        }

        let n = store.count("items", &doc(json!({"price": {"$gte": 15}}))).await.unwrap();
        assert_eq!(n, 2);
        let n = store.count("items", &doc(json!({"_id": {"$in": [1, 3]}}))).await.unwrap();
        assert_eq!(n, 2);
        let n = store.count("items", &doc(json!({"tags": "a"}))).await.unwrap();
        assert_eq!(n, 3);
        let n = store.count("items", &doc(json!({"missing": null}))).await.unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn test_update_operators() {
        let store = MemoryStore::new();
        store
            .insert("carts", "_id", &doc(json!({"_id": 1, "total": 1, "items": []})))
            .await
            .unwrap();

        let result = store
            .update_one(
                "carts",
                &doc(json!({"_id": 1})),
                &doc(json!({"$inc": {"total": 2}, "$push": {"items": "hat"}})),
            )
            .await
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 1, modified: 1 });

        let after = store.find_one("carts", &doc(json!({"_id": 1}))).await.unwrap().unwrap();
        assert_eq!(after["total"], json!(3));
        assert_eq!(after["items"], json!(["hat"]));

        let missing = store
            .update_one("carts", &doc(json!({"_id": 9})), &doc(json!({"$set": {"total": 0}})))
            .await
            .unwrap();
        assert_eq!(missing, UpdateResult::default());

        let err = store
            .update_one("carts", &doc(json!({"_id": 1})), &doc(json!({"total": 0})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate(_)));
    }

    #[tokio::test]
    async fn test_find_one_and_update_returns_requested_version() {
        let store = MemoryStore::new();
        store.insert("c", "_id", &doc(json!({"_id": 1, "v": 1}))).await.unwrap();

        let before = store
            .find_one_and_update("c", &doc(json!({"_id": 1})), &doc(json!({"$set": {"v": 2}})), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before["v"], json!(1));

        let after = store
            .find_one_and_update("c", &doc(json!({"_id": 1})), &doc(json!({"$set": {"v": 3}})), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after["v"], json!(3));
    }

    #[tokio::test]
    async fn test_unique_sparse_index() {
        let store = MemoryStore::new();
        store
            .create_index("users", &IndexSpec::ascending("email").unique().sparse())
            .await
            .unwrap();

        store.insert("users", "_id", &doc(json!({"_id": 1}))).await.unwrap();
        store.insert("users", "_id", &doc(json!({"_id": 2}))).await.unwrap();
        store
            .insert("users", "_id", &doc(json!({"_id": 3, "email": "a@b.co"})))
            .await
            .unwrap();
        let err = store
            .insert("users", "_id", &doc(json!({"_id": 4, "email": "a@b.co"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));

        let err = store
            .create_index("users", &IndexSpec::ascending("email"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IndexExists(_)));
    }

    #[tokio::test]
    async fn test_distinct_flattens_arrays() {
        let store = MemoryStore::new();
        store.insert("c", "_id", &doc(json!({"_id": 1, "tag": ["x", "y"]}))).await.unwrap();
        store.insert("c", "_id", &doc(json!({"_id": 2, "tag": "y"}))).await.unwrap();
        store.insert("c", "_id", &doc(json!({"_id": 3, "tag": "z"}))).await.unwrap();

        let values = store.distinct("c", "tag", &Document::new()).await.unwrap();
        assert_eq!(values, vec![json!("x"), json!("y"), json!("z")]);
    }

    #[tokio::test]
    async fn test_capped_log_evicts_oldest() {
        let store = MemoryStore::new();
        store
            .create_collection("log", &CollectionOptions::capped(2, 1024))
            .await
            .unwrap();

        for i in 1..=3 {
            let position = store.append("log", &doc(json!({"n": i}))).await.unwrap();
            assert_eq!(position, i);
        }
        assert_eq!(store.count("log", &Document::new()).await.unwrap(), 2);
        assert_eq!(store.latest_position("log").await.unwrap(), 3);

        let first = store
            .tail_next("log", 0, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.position, 2);

        let err = store
            .insert("log", "_id", &doc(json!({"_id": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn test_append_requires_capped_collection() {
        let store = MemoryStore::new();
        let err = store.append("nope", &Document::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::CollectionNotFound(_)));

        store.create_collection("plain", &CollectionOptions::default()).await.unwrap();
        let err = store.append("plain", &Document::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotCapped(_)));

        let err = store
            .create_collection("plain", &CollectionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CollectionExists(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_next_times_out() {
        let store = MemoryStore::new();
        store
            .create_collection("log", &CollectionOptions::capped(8, 1024))
            .await
            .unwrap();
        let next = store.tail_next("log", 0, Duration::from_secs(1)).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_tail_next_wakes_on_append() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_collection("log", &CollectionOptions::capped(8, 1024))
            .await
            .unwrap();

        let tailer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.tail_next("log", 0, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        store.append("log", &doc(json!({"key": "ping"}))).await.unwrap();

        let record = tailer.await.unwrap().unwrap().unwrap();
        assert_eq!(record.position, 1);
        assert_eq!(record.document["key"], json!("ping"));
    }
}
