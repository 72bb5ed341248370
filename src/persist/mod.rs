//! Persistence of models in a document store.
//!
//! A `Collection` binds a schema with a primary key to a named collection
//! and runs every store call through the bounded retry policy. Writes emit
//! the `ModelSignals` of the collection.
//!
//! ```no_run
//! # async fn run() -> tbone::TboneResult<()> {
//! use serde_json::json;
//! use tbone::{doc, Collection, Field, IndexSpec, MemoryStore, Model, Schema};
//!
//! let schema = Schema::builder("Book")
//!     .field("isbn", Field::string().primary_key())
//!     .field("title", Field::string().required())
//!     .build()?;
//! let books = Collection::builder(&schema)
//!     .namespace("library")
//!     .index(IndexSpec::ascending("title"))
//!     .build()?;
//! let store = MemoryStore::new().into_handle();
//! books.ensure_collection(&store).await?;
//!
//! let mut book = Model::from_data(&schema, &json!({"isbn": "123", "title": "T"}))?;
//! books.save(&store, &mut book).await?;
//! let found = books.find_one(&store, &doc!({"isbn": "123"})).await?;
//! assert_eq!(found, Some(book));
//! # Ok(())
//! # }
//! ```

mod retry;
pub mod signals;

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value as JsonValue;

use crate::config::RetryPolicy;
use crate::error::{ConfigError, TboneError, TboneResult, ValidationError};
use crate::field::{Field, FieldKind, ScalarKind};
use crate::model::{DerivedValue, Model, Schema};
use crate::object_id::ObjectId;
use crate::storage::{
    CollectionOptions, Document, IndexSpec, Query, StoreError, StoreHandle, UpdateResult,
};
use crate::value::Value;

pub use signals::{model_signals, BulkWriteEvent, ModelSignals, WriteEvent};

use retry::with_retry;

/// Name of the derived value reporting when a document was created.
pub const CREATED: &str = "created";

fn is_object_id(field: &Field) -> bool {
    matches!(field.kind(), FieldKind::Scalar(ScalarKind::ObjectId))
}

/// Builds a `Collection`.
#[derive(Debug)]
pub struct CollectionBuilder {
    schema: Arc<Schema>,
    namespace: Option<String>,
    name: Option<String>,
    indexes: Vec<IndexSpec>,
    retry: RetryPolicy,
    signals: Option<Arc<ModelSignals>>,
}

impl CollectionBuilder {
    /// Prefixes the collection name with `namespace_`.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Overrides the collection name, which defaults to the lowercase model
    /// name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares an index created by `ensure_collection`.
    #[must_use]
    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// Replaces the default retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Uses `signals` instead of the process-wide `model_signals()`.
    #[must_use]
    pub fn signals(mut self, signals: Arc<ModelSignals>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Finishes the binding.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingPrimaryKey` if the schema declares no
    /// primary key, or `ConfigError::InvalidSetting` for a bad retry policy.
    pub fn build(self) -> Result<Collection, ConfigError> {
        let primary_key = self
            .schema
            .primary_key()
            .ok_or_else(|| ConfigError::MissingPrimaryKey {
                model: self.schema.name().to_string(),
            })?
            .to_string();
        let keyed_by_object_id = self.schema.field(&primary_key).is_some_and(is_object_id);
        if self.schema.derived().iter().any(|d| d.name() == CREATED) && !keyed_by_object_id {
            return Err(ConfigError::InvalidSetting {
                setting: format!("{}.{CREATED}", self.schema.name()),
                reason: "requires an object id primary key".to_string(),
            });
        }
        let retry = self.retry.validate()?;
        let base = self
            .name
            .unwrap_or_else(|| self.schema.name().to_lowercase());
        let name = match self.namespace {
            Some(namespace) => format!("{namespace}_{base}"),
            None => base,
        };
        Ok(Collection {
            schema: self.schema,
            name,
            primary_key,
            indexes: self.indexes,
            retry,
            signals: self.signals.unwrap_or_else(model_signals),
        })
    }
}

/// A model type bound to a store collection.
#[derive(Debug, Clone)]
pub struct Collection {
    schema: Arc<Schema>,
    name: String,
    primary_key: String,
    indexes: Vec<IndexSpec>,
    retry: RetryPolicy,
    signals: Arc<ModelSignals>,
}

impl Collection {
    /// Starts binding `schema`, which must declare a primary key.
    #[must_use]
    pub fn builder(schema: &Arc<Schema>) -> CollectionBuilder {
        CollectionBuilder {
            schema: Arc::clone(schema),
            namespace: None,
            name: None,
            indexes: Vec::new(),
            retry: RetryPolicy::default(),
            signals: None,
        }
    }

    /// Derived value `created`: the creation time encoded in the object id
    /// primary key `primary_key`, or `Null` while the key is unset.
    ///
    /// Declare it on a schema whose key is an object id:
    ///
    /// ```
    /// use tbone::{Collection, Field, Schema};
    ///
    /// let schema = Schema::builder("Post")
    ///     .field("_id", Field::object_id().primary_key())
    ///     .derived(Collection::created_value("_id"))
    ///     .build()?;
    /// let posts = Collection::builder(&schema).build()?;
    /// assert_eq!(posts.primary_key_type(), "object_id");
    /// # Ok::<(), tbone::ConfigError>(())
    /// ```
    #[must_use]
    pub fn created_value(primary_key: impl Into<String>) -> DerivedValue {
        let primary_key = primary_key.into();
        DerivedValue::computed(CREATED, move |model| {
            model
                .get(&primary_key)
                .and_then(Value::as_object_id)
                .map_or(Value::Null, |id| Value::DateTime(id.generation_time()))
        })
    }

    /// Field referencing documents of this collection.
    #[must_use]
    pub fn reference(&self) -> Field {
        Field::reference(self.name.clone(), &self.schema)
    }

    /// Bound schema.
    #[must_use]
    pub const fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Store collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the primary key field.
    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Native type name of the primary key field.
    #[must_use]
    pub fn primary_key_type(&self) -> &'static str {
        self.schema
            .field(&self.primary_key)
            .map_or("null", |field| field.native_type())
    }

    /// Indexes created by `ensure_collection`.
    #[must_use]
    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Retry policy applied to every store call.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Signals emitted by writes.
    #[must_use]
    pub const fn signals(&self) -> &Arc<ModelSignals> {
        &self.signals
    }

    fn load(&self, document: &Document) -> TboneResult<Model> {
        Model::from_document(&self.schema, document)
    }

    /// Filter selecting `model` by primary key.
    fn key_filter(&self, model: &Model) -> TboneResult<Document> {
        let missing = || TboneError::MissingPrimaryKeyValue {
            model: self.schema.name().to_string(),
        };
        let value = model.pk().ok_or_else(missing)?;
        let field = self.schema.field(&self.primary_key).ok_or_else(missing)?;
        let wire = field
            .export(value)
            .map_err(|e| TboneError::from(e).attribute(self.schema.name(), &self.primary_key))?;
        let mut filter = Document::new();
        filter.insert(self.primary_key.clone(), wire);
        Ok(filter)
    }

    /// Fills a missing object id primary key. Other key types must be set
    /// by the caller.
    fn assign_key(&self, model: &mut Model) -> TboneResult<()> {
        if model.pk().is_some() {
            return Ok(());
        }
        if self.schema.field(&self.primary_key).is_some_and(is_object_id) {
            model.set(&self.primary_key, ObjectId::new())?;
        }
        Ok(())
    }

    fn write_event(&self, store: &StoreHandle, instance: Model, created: bool) -> WriteEvent {
        WriteEvent {
            sender: self.schema.id(),
            store: Arc::clone(store),
            instance,
            created,
        }
    }

    async fn notify_saved(&self, store: &StoreHandle, instance: Model, created: bool) {
        let event = self.write_event(store, instance, created);
        let outcomes = self.signals.post_save.send_robust(&self.schema, event).await;
        log_receiver_failures(&self.name, "post_save", outcomes);
    }

    /// First document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns a store error once retries are spent, or a coercion error if
    /// the stored document does not fit the schema.
    pub async fn find_one(&self, store: &StoreHandle, filter: &Document) -> TboneResult<Option<Model>> {
        let name = self.name.as_str();
        let found = with_retry(&self.retry, self.schema.name(), "find_one", move || {
            store.find_one(name, filter)
        })
        .await?;
        found.as_ref().map(|doc| self.load(doc)).transpose()
    }

    /// Documents matching `query`, in the order the store returns them.
    ///
    /// # Errors
    ///
    /// Returns a store error once retries are spent, or a coercion error if
    /// a stored document does not fit the schema.
    pub async fn find(&self, store: &StoreHandle, query: &Query) -> TboneResult<Vec<Model>> {
        let name = self.name.as_str();
        let documents = with_retry(&self.retry, self.schema.name(), "find", move || {
            store.find(name, query)
        })
        .await?;
        documents.iter().map(|doc| self.load(doc)).collect()
    }

    /// Number of documents matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns a store error once retries are spent.
    pub async fn count(&self, store: &StoreHandle, filter: &Document) -> TboneResult<u64> {
        let name = self.name.as_str();
        Ok(with_retry(&self.retry, self.schema.name(), "count", move || {
            store.count(name, filter)
        })
        .await?)
    }

    /// Distinct wire values of `field` among matching documents.
    ///
    /// # Errors
    ///
    /// Returns a store error once retries are spent.
    pub async fn distinct(
        &self,
        store: &StoreHandle,
        field: &str,
        filter: &Document,
    ) -> TboneResult<Vec<JsonValue>> {
        let name = self.name.as_str();
        Ok(with_retry(&self.retry, self.schema.name(), "distinct", move || {
            store.distinct(name, field, filter)
        })
        .await?)
    }

    /// Removes every document matching `filter` and returns how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns a store error once retries are spent.
    pub async fn delete_entries(&self, store: &StoreHandle, filter: &Document) -> TboneResult<u64> {
        let name = self.name.as_str();
        Ok(with_retry(&self.retry, self.schema.name(), "delete_entries", move || {
            store.remove(name, filter)
        })
        .await?)
    }

    /// Creates an index. An index that already exists is not an error.
    ///
    /// # Errors
    ///
    /// Returns a store error once retries are spent, or if existing
    /// documents violate a unique index.
    pub async fn create_index(&self, store: &StoreHandle, index: &IndexSpec) -> TboneResult<()> {
        let name = self.name.as_str();
        match with_retry(&self.retry, self.schema.name(), "create_index", move || {
            store.create_index(name, index)
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::IndexExists(index)) => {
                tracing::debug!(collection = %self.name, index = %index, "index already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the collection if it is missing, then every declared index.
    ///
    /// # Errors
    ///
    /// Returns a store error once retries are spent.
    pub async fn ensure_collection(&self, store: &StoreHandle) -> TboneResult<()> {
        let name = self.name.as_str();
        let options = &CollectionOptions::default();
        let created = with_retry(&self.retry, self.schema.name(), "create_collection", move || {
            store.create_collection(name, options)
        })
        .await;
        match created {
            Ok(()) => tracing::info!(collection = %self.name, "created collection"),
            Err(StoreError::CollectionExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        for index in &self.indexes {
            self.create_index(store, index).await?;
        }
        Ok(())
    }

    /// Validates and upserts `model`. Returns true when the instance had no
    /// primary key value before the call, i.e. the save created it.
    ///
    /// A missing object id key is generated first. `pre_save` receivers run
    /// before the write and can veto it by failing; `post_save` runs after.
    ///
    /// # Errors
    ///
    /// Returns a validation error, a `pre_save` receiver's error, or a store
    /// error once retries are spent.
    pub async fn save(&self, store: &StoreHandle, model: &mut Model) -> TboneResult<bool> {
        self.ensure_schema(model)?;
        let created = model.pk().is_none();
        self.assign_key(model)?;
        model.validate()?;

        let event = self.write_event(store, model.clone(), created);
        self.signals.pre_save.send(&self.schema, event).await?;

        let document = model.to_document()?;
        let name = self.name.as_str();
        let key = self.primary_key.as_str();
        let document = &document;
        with_retry(&self.retry, self.schema.name(), "save", move || {
            store.upsert(name, key, document)
        })
        .await?;

        self.notify_saved(store, model.clone(), created).await;
        Ok(created)
    }

    /// Validates and inserts `model`. Fails if a document with the same
    /// primary key exists.
    ///
    /// # Errors
    ///
    /// Returns a validation error or a store error such as
    /// `StoreError::DuplicateKey`.
    pub async fn insert(&self, store: &StoreHandle, model: &mut Model) -> TboneResult<()> {
        self.ensure_schema(model)?;
        self.assign_key(model)?;
        model.validate()?;

        let document = model.to_document()?;
        let name = self.name.as_str();
        let key = self.primary_key.as_str();
        let document = &document;
        with_retry(&self.retry, self.schema.name(), "insert", move || {
            store.insert(name, key, document)
        })
        .await?;

        self.notify_saved(store, model.clone(), true).await;
        Ok(())
    }

    /// Inserts every instance in order, then emits one `post_bulk_save`.
    /// All instances are validated before anything is written.
    ///
    /// # Errors
    ///
    /// Returns the first validation error, or the first store error; earlier
    /// instances stay inserted.
    pub async fn insert_many(&self, store: &StoreHandle, models: &mut [Model]) -> TboneResult<()> {
        let mut documents = Vec::with_capacity(models.len());
        for model in models.iter_mut() {
            self.ensure_schema(model)?;
            self.assign_key(model)?;
            model.validate()?;
            documents.push(model.to_document()?);
        }

        let name = self.name.as_str();
        let key = self.primary_key.as_str();
        for document in &documents {
            with_retry(&self.retry, self.schema.name(), "insert_many", move || {
                store.insert(name, key, document)
            })
            .await?;
        }

        let event = BulkWriteEvent {
            sender: self.schema.id(),
            store: Arc::clone(store),
            instances: models.to_vec(),
        };
        let outcomes = self.signals.post_bulk_save.send_robust(&self.schema, event).await;
        log_receiver_failures(&self.name, "post_bulk_save", outcomes);
        Ok(())
    }

    /// Writes `model` by primary key and returns the stored document after
    /// the update, or `None` if no document has that key.
    ///
    /// With `data` of `None` every field except the key is written. With
    /// `Some(data)` the data is merged into `model` first and only the
    /// fields it names are written. The key is never part of the update and
    /// a key inside `data` is ignored.
    ///
    /// # Errors
    ///
    /// Returns `TboneError::MissingPrimaryKeyValue` if `model` has no key,
    /// a coercion or validation error for the written fields, or a store
    /// error once retries are spent.
    pub async fn update(
        &self,
        store: &StoreHandle,
        model: &mut Model,
        data: Option<&JsonValue>,
    ) -> TboneResult<Option<Model>> {
        self.ensure_schema(model)?;
        let filter = self.key_filter(model)?;
        let data = data.map(|data| match data {
            JsonValue::Object(map) => {
                let mut map = map.clone();
                map.remove(&self.primary_key);
                JsonValue::Object(map)
            }
            other => other.clone(),
        });
        if let Some(data) = &data {
            model.import_data(data)?;
        }

        let written: Vec<&str> = match data.as_ref().and_then(JsonValue::as_object) {
            Some(keys) => self
                .schema
                .field_names()
                .filter(|name| keys.contains_key(*name))
                .collect(),
            None => self.schema.field_names().collect(),
        };

        let mut set = Document::new();
        for name in written {
            if name == self.primary_key {
                continue;
            }
            let Some(field) = self.schema.field(name) else {
                continue;
            };
            let value = model.get(name).unwrap_or(&Value::Null);
            field.validate(value).map_err(|source| ValidationError {
                model: self.schema.name().to_string(),
                field: name.to_string(),
                source,
            })?;
            let wire = field
                .export(value)
                .map_err(|e| TboneError::from(e).attribute(self.schema.name(), name))?;
            set.insert(name.to_string(), wire);
        }
        if set.is_empty() {
            return self.find_one(store, &filter).await;
        }
        let mut update = Document::new();
        update.insert("$set".to_string(), JsonValue::Object(set));

        let collection = self.name.as_str();
        let (filter, update) = (&filter, &update);
        let stored = with_retry(&self.retry, self.schema.name(), "update", move || {
            store.find_one_and_update(collection, filter, update, true)
        })
        .await?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        let updated = self.load(&stored)?;
        self.notify_saved(store, updated.clone(), false).await;
        Ok(Some(updated))
    }

    /// Partial update of the document with primary key `pk`.
    ///
    /// # Errors
    ///
    /// Same as `update`.
    pub async fn modify(
        &self,
        store: &StoreHandle,
        pk: impl Into<Value>,
        data: &JsonValue,
    ) -> TboneResult<Option<Model>> {
        let mut model = Model::new(&self.schema);
        model.set(&self.primary_key, pk)?;
        self.update(store, &mut model, Some(data)).await
    }

    /// Applies raw update operators (`$set`, `$unset`, `$inc`, `$push`) to
    /// the first document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns a store error once retries are spent, including
    /// `StoreError::InvalidUpdate` for a malformed update.
    pub async fn update_one(
        &self,
        store: &StoreHandle,
        filter: &Document,
        update: &Document,
    ) -> TboneResult<UpdateResult> {
        let name = self.name.as_str();
        Ok(with_retry(&self.retry, self.schema.name(), "update_one", move || {
            store.update_one(name, filter, update)
        })
        .await?)
    }

    /// Deletes `model` by primary key and returns how many documents were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns `TboneError::MissingPrimaryKeyValue` if `model` has no key, or
    /// a store error once retries are spent.
    pub async fn delete(&self, store: &StoreHandle, model: &Model) -> TboneResult<u64> {
        self.ensure_schema(model)?;
        let filter = self.key_filter(model)?;
        let removed = self.delete_entries(store, &filter).await?;
        if removed > 0 {
            let event = self.write_event(store, model.clone(), false);
            let outcomes = self.signals.post_delete.send_robust(&self.schema, event).await;
            log_receiver_failures(&self.name, "post_delete", outcomes);
        }
        Ok(removed)
    }

    /// Serializes instances concurrently. The output order matches `models`.
    ///
    /// # Errors
    ///
    /// Returns the first serialization error in input order.
    pub async fn serialize_many(&self, models: &[Model]) -> TboneResult<Vec<Document>> {
        join_all(models.iter().map(Model::serialize))
            .await
            .into_iter()
            .collect()
    }

    fn ensure_schema(&self, model: &Model) -> TboneResult<()> {
        if model.schema().id() == self.schema.id() {
            Ok(())
        } else {
            Err(TboneError::internal(format!(
                "collection '{}' stores '{}' instances, got '{}'",
                self.name,
                self.schema.name(),
                model.name()
            )))
        }
    }
}

fn log_receiver_failures<R>(
    collection: &str,
    signal: &'static str,
    outcomes: Vec<(crate::dispatch::ReceiverKey, anyhow::Result<R>)>,
) {
    for (receiver, outcome) in outcomes {
        if let Err(e) = outcome {
            tracing::error!(
                collection,
                signal,
                receiver = %receiver,
                error = %e,
                "signal receiver failed after write"
            );
        }
    }
}
