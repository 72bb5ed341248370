//! Schema-backed model instances.
//!
//! A `Model` pairs a frozen `Schema` with a per-instance value store. Field
//! values are read and written through `get`/`set`; wire data enters through
//! `import_data`/`deserialize` and leaves through `export_data`/`serialize`.
//!
//! ```
//! use serde_json::json;
//! use tbone::{Field, Model, Projection, Schema};
//!
//! let schema = Schema::builder("Hat")
//!     .field("sku", Field::string().primary_key())
//!     .field("size", Field::integer().default(7))
//!     .field("note", Field::string().projection(Projection::IfPresent))
//!     .build()?;
//!
//! let hat = Model::from_data(&schema, &json!({"sku": "HAT-1"}))?;
//! let wire = hat.export_data()?;
//! assert_eq!(serde_json::Value::Object(wire), json!({"sku": "HAT-1", "size": 7}));
//! # Ok::<(), tbone::TboneError>(())
//! ```

pub mod schema;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value as JsonValue;

use crate::error::{FieldError, TboneError, TboneResult, ValidationError};
use crate::field::{json_type_name, Field, Projection};
use crate::storage::Document;
use crate::value::{NativeMap, Value};

pub use schema::{DerivedValue, ModelTypeId, Schema, SchemaBuilder};

static NULL: Value = Value::Null;

/// A field failure tagged with the name of the field that raised it.
type FieldFailure = (String, FieldError);

/// An instance of a model type.
#[derive(Clone)]
pub struct Model {
    schema: Arc<Schema>,
    data: HashMap<String, Value>,
}

impl Model {
    /// Creates an instance with every declared default materialized.
    #[must_use]
    pub fn new(schema: &Arc<Schema>) -> Self {
        let data = schema
            .fields()
            .filter_map(|(name, field)| {
                let value = field.default_value();
                (!value.is_null()).then(|| (name.to_string(), value))
            })
            .collect();
        Self {
            schema: Arc::clone(schema),
            data,
        }
    }

    /// Creates an instance from wire data. Values are converted but not
    /// validated; call `validate` or use `deserialize` for that.
    ///
    /// # Errors
    ///
    /// Returns `TboneError::Coercion` for the first value that cannot be
    /// converted, or `TboneError::Field` if `wire` is not an object.
    pub fn from_data(schema: &Arc<Schema>, wire: &JsonValue) -> TboneResult<Self> {
        let mut model = Self::new(schema);
        model.import_data(wire)?;
        Ok(model)
    }

    /// Loads an instance from its storage form. Unknown keys are dropped and
    /// the result is not validated.
    ///
    /// # Errors
    ///
    /// Returns `TboneError::Coercion` for the first value that cannot be
    /// converted.
    pub fn from_document(schema: &Arc<Schema>, document: &Document) -> TboneResult<Self> {
        let mut model = Self::new(schema);
        model
            .merge(document)
            .map_err(|failure| model.coercion(failure))?;
        Ok(model)
    }

    /// Schema of the instance.
    #[must_use]
    pub const fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Name of the model type.
    #[must_use]
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Value of a field, if it has one.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Mutable access to a declared field's value, inserting `Null` if the
    /// field has no value yet.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        if !self.schema.has_field(name) {
            return None;
        }
        Some(self.data.entry(name.to_string()).or_default())
    }

    /// Stores a native value.
    ///
    /// # Errors
    ///
    /// Returns `FieldError::UnknownField` if the model declares no such field.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), FieldError> {
        if !self.schema.has_field(name) {
            return Err(FieldError::UnknownField {
                name: name.to_string(),
            });
        }
        self.data.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Removes a field's value, returning it.
    pub fn unset(&mut self, name: &str) -> Option<Value> {
        self.data.remove(name)
    }

    /// True if the field holds a non-null value.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.data.get(name).is_some_and(|v| !v.is_null())
    }

    /// The primary key value, if the schema declares one and it is set.
    #[must_use]
    pub fn pk(&self) -> Option<&Value> {
        self.schema
            .primary_key()
            .and_then(|name| self.data.get(name))
            .filter(|v| !v.is_null())
    }

    /// Populated fields in declaration order.
    pub fn items(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema.field_names().filter_map(|name| {
            self.data
                .get(name)
                .filter(|v| !v.is_null())
                .map(|v| (name, v))
        })
    }

    fn value_of(&self, name: &str) -> &Value {
        self.data.get(name).unwrap_or(&NULL)
    }

    fn coercion(&self, (field, source): FieldFailure) -> TboneError {
        TboneError::Coercion {
            model: self.name().to_string(),
            field,
            source,
        }
    }

    /// Merges wire data into the instance. Keys that are not fields are
    /// ignored; fields absent from `wire` keep their current value, so
    /// repeated partial imports only touch the keys they carry.
    ///
    /// The merge is all or nothing: a value that fails to convert leaves the
    /// instance unchanged.
    ///
    /// # Errors
    ///
    /// Returns `TboneError::Coercion` for the first value that cannot be
    /// converted, or `TboneError::Field` if `wire` is not an object.
    pub fn import_data(&mut self, wire: &JsonValue) -> TboneResult<()> {
        let JsonValue::Object(data) = wire else {
            return Err(FieldError::NotAMapping {
                found: json_type_name(wire).to_string(),
            }
            .into());
        };
        self.merge(data).map_err(|failure| self.coercion(failure))
    }

    fn merge(&mut self, data: &Document) -> Result<(), FieldFailure> {
        let mut imported = Vec::with_capacity(data.len());
        for (name, field) in self.schema.fields() {
            if let Some(wire) = data.get(name) {
                let value = field
                    .import(wire)
                    .map_err(|e| (name.to_string(), e))?;
                imported.push((name.to_string(), value));
            }
        }
        self.data.extend(imported);
        Ok(())
    }

    /// Builds a nested instance from a raw wire mapping.
    pub(crate) fn import_nested(schema: &Arc<Schema>, data: &Document) -> Result<Self, FieldError> {
        let mut model = Self::new(schema);
        model
            .merge(data)
            .map_err(|(field, e)| FieldError::nested(schema.name(), field, e))?;
        Ok(model)
    }

    /// Builds a nested instance from a native mapping of field values.
    pub(crate) fn from_native(schema: &Arc<Schema>, entries: &NativeMap) -> Result<Self, FieldError> {
        let mut model = Self::new(schema);
        for (name, value) in entries {
            model.set(name, value.clone())?;
        }
        Ok(model)
    }

    fn export_fields(&self) -> Result<Document, FieldFailure> {
        let mut out = Document::new();
        for (name, field) in self.schema.fields() {
            let projection = field.projection_mode();
            if projection == Projection::Never {
                continue;
            }
            let wire = field
                .export(self.value_of(name))
                .map_err(|e| (name.to_string(), e))?;
            if !wire.is_null() || projection == Projection::Always {
                out.insert(name.to_string(), wire);
            }
        }
        Ok(out)
    }

    pub(crate) fn export_nested(&self) -> Result<Document, FieldError> {
        self.export_fields()
            .map_err(|(field, e)| FieldError::nested(self.name(), field, e))
    }

    /// Synchronous wire export under projection rules, without derived
    /// values.
    ///
    /// # Errors
    ///
    /// Returns `TboneError::Coercion` if a value does not fit its field.
    pub fn export_data(&self) -> TboneResult<Document> {
        self.export_fields().map_err(|failure| self.coercion(failure))
    }

    /// Storage form: every field regardless of projection, defaults
    /// substituted for nulls. A null primary key is left out.
    ///
    /// # Errors
    ///
    /// Returns `TboneError::Coercion` if a value does not fit its field.
    pub fn to_document(&self) -> TboneResult<Document> {
        let mut out = Document::new();
        for (name, field) in self.schema.fields() {
            let wire = field
                .export(self.value_of(name))
                .map_err(|e| self.coercion((name.to_string(), e)))?;
            if wire.is_null() && field.is_primary_key() {
                continue;
            }
            out.insert(name.to_string(), wire);
        }
        Ok(out)
    }

    /// Validates every field in declaration order and stops at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the `ValidationError` of the first rejected field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, field) in self.schema.fields() {
            field
                .validate(self.value_of(name))
                .map_err(|source| ValidationError {
                    model: self.name().to_string(),
                    field: name.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Strips keys that are not writable fields, merges the rest and
    /// validates the result.
    ///
    /// # Errors
    ///
    /// Returns `TboneError::Coercion` for a value that cannot be converted
    /// and `TboneError::Validation` if the merged instance is invalid.
    pub fn deserialize(&mut self, wire: &JsonValue) -> TboneResult<()> {
        let JsonValue::Object(data) = wire else {
            return Err(FieldError::NotAMapping {
                found: json_type_name(wire).to_string(),
            }
            .into());
        };
        let writable: Document = data
            .iter()
            .filter(|(key, _)| {
                self.schema
                    .field(key)
                    .is_some_and(|field| !field.is_readonly())
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.merge(&writable).map_err(|failure| self.coercion(failure))?;
        self.validate()?;
        Ok(())
    }

    fn projected_fields(&self) -> Vec<(&str, &Field)> {
        self.schema
            .fields()
            .filter(|(_, field)| field.projection_mode() != Projection::Never)
            .collect()
    }

    async fn derived_values(&self) -> TboneResult<Vec<(String, Value)>> {
        let mut values = Vec::with_capacity(self.schema.derived().len());
        for derived in self.schema.derived() {
            let value = derived
                .produce(self)
                .await
                .map_err(|e| e.attribute(self.name(), derived.name()))?;
            values.push((derived.name().to_string(), value));
        }
        Ok(values)
    }

    /// Async wire form: projected fields in declaration order followed by
    /// derived values. Composite fields serialize their children
    /// concurrently.
    ///
    /// # Errors
    ///
    /// Returns the first conversion error, attributed to its field, or the
    /// error of a failing derived value.
    pub async fn serialize(&self) -> TboneResult<Document> {
        let fields = self.projected_fields();
        let outcomes = join_all(
            fields
                .iter()
                .map(|(name, field)| field.serialize(self.value_of(name))),
        )
        .await;

        let mut out = Document::new();
        for ((name, field), outcome) in fields.iter().zip(outcomes) {
            let wire = outcome.map_err(|e| e.attribute(self.name(), name))?;
            if !wire.is_null() || field.projection_mode() == Projection::Always {
                out.insert((*name).to_string(), wire);
            }
        }
        for (name, value) in self.derived_values().await? {
            let wire = value.to_json().map_err(|e| e.attribute(self.name(), &name))?;
            out.insert(name, wire);
        }
        Ok(out)
    }

    /// Native form under the same projection rules as `serialize`.
    ///
    /// # Errors
    ///
    /// Returns the error of a failing derived value.
    pub async fn serialize_native(&self) -> TboneResult<NativeMap> {
        let mut out = NativeMap::with_capacity(self.schema.len());
        for (name, field) in self.projected_fields() {
            let value = match self.value_of(name) {
                Value::Null => field.default_value(),
                value => value.clone(),
            };
            if !value.is_null() || field.projection_mode() == Projection::Always {
                out.insert(name.to_string(), value);
            }
        }
        out.extend(self.derived_values().await?);
        Ok(out)
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.schema.id() == other.schema.id()
            && self
                .schema
                .field_names()
                .all(|name| self.value_of(name) == other.value_of(name))
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} instance>", self.name())
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.name());
        for (name, value) in self.items() {
            s.field(name, value);
        }
        s.finish()
    }
}
