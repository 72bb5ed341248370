//! Typed, self-validating schema fields.
//!
//! A `Field` converts one named attribute between its wire form
//! (`serde_json::Value`) and its native form (`Value`), and checks native
//! values against an ordered validator chain. Fields are declared with
//! builder-style constructors:
//!
//! ```
//! use tbone::{Field, Projection};
//!
//! let rating = Field::integer().min(0.0).max(5.0).default(3);
//! let notes = Field::list(Field::string()).projection(Projection::IfPresent);
//!
//! assert!(rating.has_default());
//! assert_eq!(notes.wire_type(), "array");
//! ```

mod composite;
mod reference;
mod simple;
pub mod validators;

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ConfigError, FieldError, TboneResult};
use crate::model::Schema;
use crate::object_id::DbRef;
use crate::value::Value;

pub use simple::ScalarKind;
pub use validators::Validator;

pub(crate) use simple::json_type_name;

/// When a field's null value appears in serialized output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    /// Always emitted, null included.
    #[default]
    Always,
    /// Emitted unless null.
    IfPresent,
    /// Never emitted.
    Never,
}

/// Default value of a field: a fixed value or a producer called on demand.
#[derive(Clone)]
pub enum FieldDefault {
    /// A fixed value, cloned on use.
    Value(Value),
    /// Called for every default.
    Producer(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl FieldDefault {
    /// Returns a fresh default value.
    #[must_use]
    pub fn produce(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Producer(producer) => producer(),
        }
    }
}

impl fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

/// What a field holds.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// A single scalar value.
    Scalar(ScalarKind),
    /// List of values of the inner field.
    List(Box<Field>),
    /// String-keyed mapping of values of the inner field.
    Dict(Box<Field>),
    /// A nested instance of one model type.
    Model(Arc<Schema>),
    /// A nested instance of one of a closed set of model types, tagged on the
    /// wire as `{"type": <model name>, "data": {...}}`.
    Poly(Vec<Arc<Schema>>),
    /// Reference to a document of another collection, stored as
    /// `{"ref": <collection>, "id": <hex id>}`.
    Ref {
        /// Name of the referenced collection.
        collection: String,
        /// Schema of the referenced documents.
        schema: Arc<Schema>,
    },
}

/// Schema unit describing one named, typed, validated attribute.
#[derive(Debug, Clone)]
pub struct Field {
    kind: FieldKind,
    required: bool,
    default: Option<FieldDefault>,
    choices: Option<Vec<Value>>,
    projection: Projection,
    readonly: bool,
    primary_key: bool,
    /// Built-in checks lead the chain; `builtins` counts them.
    validators: Vec<Validator>,
    builtins: usize,
}

impl Field {
    fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            choices: None,
            projection: Projection::default(),
            readonly: false,
            primary_key: false,
            validators: Vec::new(),
            builtins: 0,
        }
    }

    fn scalar(kind: ScalarKind) -> Self {
        Self::of(FieldKind::Scalar(kind))
    }

    /// Text.
    #[must_use]
    pub fn string() -> Self {
        Self::scalar(ScalarKind::String)
    }

    /// Integer; accepts numeric strings and integral floats.
    #[must_use]
    pub fn integer() -> Self {
        Self::scalar(ScalarKind::Integer)
    }

    /// Floating point number; accepts numeric strings.
    #[must_use]
    pub fn float() -> Self {
        Self::scalar(ScalarKind::Float)
    }

    /// Boolean; accepts `true`/`false`, `1`/`0` and their string forms.
    #[must_use]
    pub fn boolean() -> Self {
        Self::scalar(ScalarKind::Boolean)
    }

    /// UTC timestamp parsed from ISO-8601 and common layouts.
    #[must_use]
    pub fn datetime() -> Self {
        Self::scalar(ScalarKind::DateTime)
    }

    /// Calendar date.
    #[must_use]
    pub fn date() -> Self {
        Self::scalar(ScalarKind::Date)
    }

    /// Time of day.
    #[must_use]
    pub fn time() -> Self {
        Self::scalar(ScalarKind::Time)
    }

    /// Document identifier in 24-character hex form.
    #[must_use]
    pub fn object_id() -> Self {
        Self::scalar(ScalarKind::ObjectId)
    }

    /// UUID in hyphenated form.
    #[must_use]
    pub fn uuid() -> Self {
        Self::scalar(ScalarKind::Uuid)
    }

    /// Text that must look like an email address.
    #[must_use]
    pub fn email() -> Self {
        Self::scalar(ScalarKind::Email).check(Validator::email())
    }

    /// Text that must look like a URL with a scheme and a host.
    #[must_use]
    pub fn url() -> Self {
        Self::scalar(ScalarKind::Url).check(Validator::url())
    }

    /// Any JSON value, stored as is.
    #[must_use]
    pub fn free_form() -> Self {
        Self::scalar(ScalarKind::FreeForm)
    }

    /// List of values of `inner`.
    #[must_use]
    pub fn list(inner: Self) -> Self {
        Self::of(FieldKind::List(Box::new(inner)))
    }

    /// String-keyed mapping of values of `inner`.
    #[must_use]
    pub fn dict(inner: Self) -> Self {
        Self::of(FieldKind::Dict(Box::new(inner)))
    }

    /// Nested instance of `schema`.
    #[must_use]
    pub fn model(schema: &Arc<Schema>) -> Self {
        Self::of(FieldKind::Model(Arc::clone(schema)))
    }

    /// Nested instance of one of `schemas`, tagged with its model name on the wire.
    #[must_use]
    pub fn poly<'a, I>(schemas: I) -> Self
    where
        I: IntoIterator<Item = &'a Arc<Schema>>,
    {
        Self::of(FieldKind::Poly(schemas.into_iter().map(Arc::clone).collect()))
    }

    /// Reference to a document of `schema` stored in `collection`.
    #[must_use]
    pub fn reference(collection: impl Into<String>, schema: &Arc<Schema>) -> Self {
        Self::of(FieldKind::Ref {
            collection: collection.into(),
            schema: Arc::clone(schema),
        })
    }

    /// A `Null` value fails validation.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Fixed default used when the value is `Null`.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(FieldDefault::Value(value.into()));
        self
    }

    /// Default produced on demand, e.g. a fresh list or the current time.
    #[must_use]
    pub fn default_with<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.default = Some(FieldDefault::Producer(Arc::new(producer)));
        self
    }

    /// Restricts values to a closed set.
    #[must_use]
    pub fn choices<I, V>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let choices: Vec<Value> = choices.into_iter().map(Into::into).collect();
        self.choices = Some(choices.clone());
        self.check(Validator::choices(choices))
    }

    /// Sets when a null value appears in serialized output.
    #[must_use]
    pub const fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Readonly fields are skipped by `Model::deserialize`.
    #[must_use]
    pub const fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Marks the field as the primary key. Implies `required`.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.required = true;
        self
    }

    /// Numbers must be at least `min`.
    #[must_use]
    pub fn min(self, min: f64) -> Self {
        self.check(Validator::min(min))
    }

    /// Numbers must be at most `max`.
    #[must_use]
    pub fn max(self, max: f64) -> Self {
        self.check(Validator::max(max))
    }

    /// Lists must hold at least `min` items.
    #[must_use]
    pub fn min_size(self, min: usize) -> Self {
        self.check(Validator::min_size(min))
    }

    /// Lists must hold at most `max` items.
    #[must_use]
    pub fn max_size(self, max: usize) -> Self {
        self.check(Validator::max_size(max))
    }

    /// Appends a validator to the chain. Built-in checks always run first,
    /// whatever order the builder calls come in.
    #[must_use]
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    fn check(mut self, validator: Validator) -> Self {
        self.validators.insert(self.builtins, validator);
        self.builtins += 1;
        self
    }

    /// What the field holds.
    #[must_use]
    pub const fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// Whether `Null` fails validation.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }

    /// Whether a default is declared.
    #[must_use]
    pub const fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// The default value, or `Null` when none is declared.
    #[must_use]
    pub fn default_value(&self) -> Value {
        self.default.as_ref().map_or(Value::Null, FieldDefault::produce)
    }

    /// The closed set of accepted values, if declared.
    #[must_use]
    pub fn choice_values(&self) -> Option<&[Value]> {
        self.choices.as_deref()
    }

    /// When a null value is serialized.
    #[must_use]
    pub const fn projection_mode(&self) -> Projection {
        self.projection
    }

    /// Whether `Model::deserialize` skips the field.
    #[must_use]
    pub const fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Whether the field is the primary key.
    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    /// The validator chain in run order.
    #[must_use]
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Name of the wire (JSON) type.
    #[must_use]
    pub const fn wire_type(&self) -> &'static str {
        match &self.kind {
            FieldKind::Scalar(kind) => kind.wire_type(),
            FieldKind::List(_) => "array",
            FieldKind::Dict(_) | FieldKind::Model(_) | FieldKind::Poly(_) | FieldKind::Ref { .. } => {
                "object"
            }
        }
    }

    /// Name of the native type, matching `Value::type_name`.
    #[must_use]
    pub const fn native_type(&self) -> &'static str {
        match &self.kind {
            FieldKind::Scalar(kind) => kind.native_type(),
            FieldKind::List(_) => "list",
            FieldKind::Dict(_) => "dict",
            FieldKind::Model(_) | FieldKind::Poly(_) => "model",
            FieldKind::Ref { .. } => "ref",
        }
    }

    /// Converts a wire value to its native form.
    ///
    /// `null` resolves to the field's default, or `Null` without one.
    ///
    /// # Errors
    ///
    /// Returns a `FieldError` when the wire value cannot be converted.
    pub fn import(&self, wire: &JsonValue) -> Result<Value, FieldError> {
        if wire.is_null() {
            return Ok(self.default_value());
        }
        match &self.kind {
            FieldKind::Scalar(kind) => kind.import(wire),
            FieldKind::List(inner) => composite::import_list(inner, wire),
            FieldKind::Dict(inner) => composite::import_dict(inner, wire),
            FieldKind::Model(schema) => composite::import_model(schema, wire),
            FieldKind::Poly(schemas) => composite::import_poly(schemas, wire),
            FieldKind::Ref { .. } => reference::import_ref(wire),
        }
    }

    /// Converts a native value to its wire form.
    ///
    /// `Null` resolves to the exported default, or `null` without one.
    ///
    /// # Errors
    ///
    /// Returns a `FieldError` when the value does not fit the field.
    pub fn export(&self, value: &Value) -> Result<JsonValue, FieldError> {
        if value.is_null() {
            return self.export_present(&self.default_value());
        }
        self.export_present(value)
    }

    fn export_present(&self, value: &Value) -> Result<JsonValue, FieldError> {
        if value.is_null() {
            return Ok(JsonValue::Null);
        }
        match &self.kind {
            FieldKind::Scalar(kind) => kind.export(value),
            FieldKind::List(inner) => composite::export_list(inner, value),
            FieldKind::Dict(inner) => composite::export_dict(inner, value),
            FieldKind::Model(schema) => composite::export_model(schema, value),
            FieldKind::Poly(schemas) => composite::export_poly(schemas, value),
            FieldKind::Ref { collection, schema } => reference::export_ref(collection, schema, value),
        }
    }

    /// Checks a native value: required, type, then the built-in checks
    /// (choices, bounds, sizes), then added validators in declaration order,
    /// then nested values. Stops at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first `FieldError` raised.
    pub fn validate(&self, value: &Value) -> Result<(), FieldError> {
        if value.is_null() {
            return if self.required {
                Err(FieldError::Required)
            } else {
                Ok(())
            };
        }
        if let FieldKind::Scalar(kind) = &self.kind {
            kind.export(value)?;
        }
        for validator in &self.validators {
            validator.check(value)?;
        }
        match &self.kind {
            FieldKind::Scalar(_) => Ok(()),
            FieldKind::List(inner) => composite::validate_list(inner, value),
            FieldKind::Dict(inner) => composite::validate_dict(inner, value),
            FieldKind::Model(schema) => composite::validate_model(schema, value),
            FieldKind::Poly(schemas) => composite::validate_poly(schemas, value),
            FieldKind::Ref { collection, schema } => reference::validate_ref(collection, schema, value),
        }
    }

    /// Resolves a value held by a reference field into the reference it
    /// names. Accepts a `DbRef`, an instance of the referenced model, or a
    /// `{ref, id}` mapping.
    ///
    /// # Errors
    ///
    /// Returns `FieldError::MissingRefId` or `FieldError::InvalidRefId` when
    /// the referenced id is absent or unusable, and `FieldError::Coerce` when
    /// the field is not a reference.
    pub fn resolve_reference(&self, value: &Value) -> Result<DbRef, FieldError> {
        match &self.kind {
            FieldKind::Ref { collection, schema } => reference::resolve_ref(collection, schema, value),
            _ => Err(FieldError::coerce("reference", self.native_type())),
        }
    }

    /// Async wire conversion. Composite values fan their children out
    /// concurrently and reassemble them in their original order; nested
    /// models include their derived values.
    pub fn serialize<'a>(&'a self, value: &'a Value) -> BoxFuture<'a, TboneResult<JsonValue>> {
        Box::pin(async move {
            match (&self.kind, value) {
                (FieldKind::List(inner), Value::List(items)) => {
                    composite::serialize_list(inner, items).await
                }
                (FieldKind::Dict(inner), Value::Dict(entries)) => {
                    composite::serialize_dict(inner, entries).await
                }
                (FieldKind::Model(schema), Value::Model(model)) => {
                    composite::serialize_model(schema, model).await
                }
                (FieldKind::Poly(schemas), Value::Model(model)) => {
                    composite::serialize_poly(schemas, model).await
                }
                _ => Ok(self.export(value)?),
            }
        })
    }

    /// Declaration-time checks for the field bound as `model.name`.
    pub(crate) fn check_config(&self, model: &str, name: &str) -> Result<(), ConfigError> {
        if self.required && !self.default_value().is_null() {
            return Err(ConfigError::RequiredWithDefault {
                model: model.to_string(),
                field: name.to_string(),
            });
        }
        match &self.kind {
            FieldKind::List(inner) | FieldKind::Dict(inner) => inner.check_config(model, name),
            FieldKind::Poly(schemas) => {
                if schemas.is_empty() {
                    return Err(ConfigError::EmptyPolyTypes {
                        model: model.to_string(),
                        field: name.to_string(),
                    });
                }
                for (i, schema) in schemas.iter().enumerate() {
                    if schemas[..i].iter().any(|s| s.name() == schema.name()) {
                        return Err(ConfigError::DuplicatePolyType {
                            model: model.to_string(),
                            field: name.to_string(),
                            name: schema.name().to_string(),
                        });
                    }
                }
                Ok(())
            }
            FieldKind::Scalar(_) | FieldKind::Model(_) | FieldKind::Ref { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_substitution() {
        let field = Field::integer().default(5);
        assert_eq!(field.import(&JsonValue::Null).unwrap(), Value::Int(5));
        assert_eq!(field.export(&Value::Null).unwrap(), json!(5));
        assert_eq!(field.export(&Value::Int(7)).unwrap(), json!(7));

        let plain = Field::integer();
        assert_eq!(plain.import(&JsonValue::Null).unwrap(), Value::Null);
        assert_eq!(plain.export(&Value::Null).unwrap(), JsonValue::Null);
    }

    #[test]
    fn test_default_producer_gives_fresh_values() {
        let field = Field::list(Field::string()).default_with(|| Value::List(Vec::new()));
        let mut first = field.default_value();
        first.as_list_mut().unwrap().push(Value::from("x"));
        assert_eq!(field.default_value(), Value::List(Vec::new()));
    }

    #[test]
    fn test_required_is_enforced_by_validate() {
        let field = Field::string().required();
        assert_eq!(field.validate(&Value::Null), Err(FieldError::Required));
        assert!(field.validate(&Value::from("x")).is_ok());
        assert!(Field::string().validate(&Value::Null).is_ok());
    }

    #[test]
    fn test_validate_checks_type() {
        let field = Field::string();
        assert!(matches!(
            field.validate(&Value::Int(6)),
            Err(FieldError::Coerce { .. })
        ));
    }

    #[test]
    fn test_integer_range_validation() {
        let field = Field::integer().min(5.0).max(10.0);
        assert!(field.validate(&Value::Int(7)).is_ok());
        assert_eq!(field.validate(&Value::Int(4)), Err(FieldError::Min { min: 5.0 }));
        assert_eq!(field.validate(&Value::Int(11)), Err(FieldError::Max { max: 10.0 }));
    }

    #[test]
    fn test_choices() {
        let field = Field::string().choices(["S", "M", "L"]);
        assert!(field.validate(&Value::from("M")).is_ok());
        assert!(matches!(
            field.validate(&Value::from("XL")),
            Err(FieldError::Choice { .. })
        ));
        assert_eq!(field.choice_values().map(<[Value]>::len), Some(3));
    }

    #[test]
    fn test_validators_run_in_declaration_order() {
        let field = Field::integer()
            .validator(Validator::custom("first", |_| Err("first".to_string())))
            .validator(Validator::custom("second", |_| Err("second".to_string())));
        assert_eq!(field.validate(&Value::Int(1)), Err(FieldError::invalid("first")));
        let names: Vec<&str> = field.validators().iter().map(Validator::name).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn test_builtin_checks_run_before_added_validators() {
        let field = Field::integer()
            .validator(Validator::custom("odd", |v| match v.as_int() {
                Some(n) if n % 2 == 1 => Ok(()),
                _ => Err("must be odd".to_string()),
            }))
            .choices([1, 2, 3])
            .max(2.0);
        assert!(matches!(
            field.validate(&Value::Int(8)),
            Err(FieldError::Choice { .. })
        ));
        assert_eq!(field.validate(&Value::Int(3)), Err(FieldError::Max { max: 2.0 }));
        assert_eq!(field.validate(&Value::Int(2)), Err(FieldError::invalid("must be odd")));
        assert!(field.validate(&Value::Int(1)).is_ok());
        let names: Vec<&str> = field.validators().iter().map(Validator::name).collect();
        assert_eq!(names, ["choices", "max", "odd"]);
    }

    #[test]
    fn test_email_field() {
        let field = Field::email();
        assert!(field.validate(&Value::from("john@example.com")).is_ok());
        assert!(field.validate(&Value::from("john@")).is_err());
    }

    #[test]
    fn test_primary_key_implies_required() {
        let field = Field::string().primary_key();
        assert!(field.is_primary_key());
        assert!(field.is_required());
    }

    #[test]
    fn test_required_with_default_is_config_error() {
        let field = Field::integer().required().default(1);
        assert!(matches!(
            field.check_config("M", "n"),
            Err(ConfigError::RequiredWithDefault { .. })
        ));
        assert!(Field::integer().default(1).check_config("M", "n").is_ok());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Field::integer().wire_type(), "integer");
        assert_eq!(Field::integer().native_type(), "int");
        assert_eq!(Field::dict(Field::float()).wire_type(), "object");
        assert_eq!(Field::date().wire_type(), "string");
        assert_eq!(Field::date().native_type(), "date");
    }

    #[tokio::test]
    async fn test_serialize_scalar_matches_export() {
        let field = Field::datetime();
        let value = field.import(&json!("2017-07-25T12:34:14Z")).unwrap();
        let out = field.serialize(&value).await.unwrap();
        assert_eq!(out, field.export(&value).unwrap());
    }
}
