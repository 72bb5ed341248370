//! Model schemas.
//!
//! A schema is built once per model type by `SchemaBuilder`, which merges the
//! fields and derived values of every parent schema with the type's own,
//! drops excluded fields and checks the result. The finished schema is
//! frozen behind an `Arc` and shared by every instance.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::{ConfigError, TboneResult};
use crate::field::Field;
use crate::model::Model;
use crate::value::Value;

static NEXT_MODEL_TYPE: AtomicU64 = AtomicU64::new(1);

/// Identity of a model type, unique per built schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelTypeId(u64);

impl ModelTypeId {
    fn next() -> Self {
        Self(NEXT_MODEL_TYPE.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModelTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

type DerivedFn = Arc<dyn Fn(Model) -> BoxFuture<'static, TboneResult<Value>> + Send + Sync>;

/// A computed, read-only value emitted by `Model::serialize` after the
/// fields. The producer receives a snapshot of the instance.
#[derive(Clone)]
pub struct DerivedValue {
    name: String,
    producer: DerivedFn,
}

impl DerivedValue {
    /// Derived value backed by an async producer.
    pub fn new<F, Fut>(name: impl Into<String>, producer: F) -> Self
    where
        F: Fn(Model) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TboneResult<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            producer: Arc::new(move |model: Model| -> BoxFuture<'static, TboneResult<Value>> {
                Box::pin(producer(model))
            }),
        }
    }

    /// Derived value computed synchronously from the instance.
    pub fn computed<F>(name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&Model) -> Value + Send + Sync + 'static,
    {
        let compute = Arc::new(compute);
        Self::new(name, move |model| {
            let compute = Arc::clone(&compute);
            async move { Ok(compute(&model)) }
        })
    }

    /// Key the value is emitted under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn produce(&self, model: &Model) -> BoxFuture<'static, TboneResult<Value>> {
        (self.producer)(model.clone())
    }
}

impl fmt::Debug for DerivedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedValue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The frozen, ordered field set of a model type.
#[derive(Debug)]
pub struct Schema {
    id: ModelTypeId,
    name: String,
    fields: Vec<(String, Field)>,
    positions: HashMap<String, usize>,
    derived: Vec<DerivedValue>,
    primary_key: Option<String>,
}

impl Schema {
    /// Starts building a schema for the model type `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name)
    }

    /// Identity of this model type.
    #[must_use]
    pub const fn id(&self) -> ModelTypeId {
        self.id
    }

    /// Model type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in declaration order, inherited ones first.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Field declared as `name`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.positions.get(name).map(|&i| &self.fields[i].1)
    }

    /// Whether a field named `name` is declared.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no field is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Derived values in declaration order.
    #[must_use]
    pub fn derived(&self) -> &[DerivedValue] {
        &self.derived
    }

    /// Name of the primary key field, if one is declared.
    #[must_use]
    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    /// The primary key field, if declared.
    #[must_use]
    pub fn primary_key_field(&self) -> Option<&Field> {
        self.primary_key().and_then(|name| self.field(name))
    }
}

/// Builds a `Schema`.
///
/// # Example
///
/// ```
/// use tbone::{Field, Schema};
///
/// let base = Schema::builder("Base")
///     .field("created_by", Field::string())
///     .build()?;
/// let hat = Schema::builder("Hat")
///     .extends(&base)
///     .field("sku", Field::string().primary_key())
///     .field("size", Field::integer().default(7))
///     .build()?;
///
/// let names: Vec<&str> = hat.field_names().collect();
/// assert_eq!(names, ["created_by", "sku", "size"]);
/// assert_eq!(hat.primary_key(), Some("sku"));
/// # Ok::<(), tbone::ConfigError>(())
/// ```
#[derive(Debug)]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<(String, Field)>,
    derived: Vec<DerivedValue>,
    exclude: Vec<String>,
}

impl SchemaBuilder {
    /// Starts a schema for the model type `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            derived: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Inherits every field and derived value of `parent`. Parents are merged
    /// in call order; a later declaration of the same name replaces the
    /// earlier one in place.
    #[must_use]
    pub fn extends(mut self, parent: &Schema) -> Self {
        for (name, field) in &parent.fields {
            upsert(&mut self.fields, name, field.clone());
        }
        for derived in &parent.derived {
            upsert_derived(&mut self.derived, derived.clone());
        }
        self
    }

    /// Declares a field. Redeclaring a name replaces it in place.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        let name = name.into();
        upsert(&mut self.fields, &name, field);
        self
    }

    /// Declares a derived value emitted after the fields.
    #[must_use]
    pub fn derived(mut self, derived: DerivedValue) -> Self {
        upsert_derived(&mut self.derived, derived);
        self
    }

    /// Drops an inherited or declared field from the final schema.
    #[must_use]
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude.push(name.into());
        self
    }

    /// Freezes the schema.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for an unknown excluded field, more than one
    /// primary key, a required field with a default, a malformed poly field,
    /// or a derived value named like a field.
    pub fn build(self) -> Result<Arc<Schema>, ConfigError> {
        let Self {
            name,
            mut fields,
            derived,
            exclude,
        } = self;

        for excluded in &exclude {
            let before = fields.len();
            fields.retain(|(field_name, _)| field_name != excluded);
            if fields.len() == before {
                return Err(ConfigError::UnknownExcludedField {
                    model: name,
                    field: excluded.clone(),
                });
            }
        }

        let mut primary_key: Option<String> = None;
        for (field_name, field) in &fields {
            field.check_config(&name, field_name)?;
            if field.is_primary_key() {
                if let Some(first) = &primary_key {
                    return Err(ConfigError::DuplicatePrimaryKey {
                        model: name.clone(),
                        first: first.clone(),
                        second: field_name.clone(),
                    });
                }
                primary_key = Some(field_name.clone());
            }
        }

        if let Some(collision) = derived
            .iter()
            .find(|d| fields.iter().any(|(field_name, _)| field_name == d.name()))
        {
            return Err(ConfigError::DerivedNameCollision {
                model: name,
                name: collision.name().to_string(),
            });
        }

        let positions = fields
            .iter()
            .enumerate()
            .map(|(i, (field_name, _))| (field_name.clone(), i))
            .collect();

        Ok(Arc::new(Schema {
            id: ModelTypeId::next(),
            name,
            fields,
            positions,
            derived,
            primary_key,
        }))
    }
}

fn upsert(fields: &mut Vec<(String, Field)>, name: &str, field: Field) {
    match fields.iter_mut().find(|(existing, _)| existing == name) {
        Some(slot) => slot.1 = field,
        None => fields.push((name.to_string(), field)),
    }
}

fn upsert_derived(derived: &mut Vec<DerivedValue>, value: DerivedValue) {
    match derived.iter_mut().find(|d| d.name == value.name) {
        Some(slot) => *slot = value,
        None => derived.push(value),
    }
}
