//! Error types for tbone.
//!
//! Errors are strongly typed using thiserror and grouped by the layer that
//! raises them: field coercion, model validation, store access, schema
//! configuration and signal dispatch. `TboneError` wraps all of them for
//! callers that do not care about the layer.

use thiserror::Error;

use crate::storage::StoreError;

/// Failure converting or checking a single field value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    /// The value cannot be converted to the field's type.
    #[error("Cannot coerce {found} to {expected}")]
    Coerce {
        expected: &'static str,
        found: String,
    },

    /// A required field holds no value.
    #[error("This is a required field")]
    Required,

    /// The value is outside the declared choices.
    #[error("Value must be one of: {choices}")]
    Choice {
        choices: String,
    },

    /// The number is below the minimum.
    #[error("Value should be greater than or equal to {min}.")]
    Min {
        min: f64,
    },

    /// The number is above the maximum.
    #[error("Value should be less than or equal to {max}.")]
    Max {
        max: f64,
    },

    /// The list is shorter than allowed.
    #[error("List should contain at least {min} items.")]
    MinSize {
        min: usize,
    },

    /// The list is longer than allowed.
    #[error("List should contain at most {max} items.")]
    MaxSize {
        max: usize,
    },

    /// A list field got something else.
    #[error("Expected a list, got {found}")]
    NotAList {
        found: String,
    },

    /// A mapping was expected.
    #[error("Expected a mapping, got {found}")]
    NotAMapping {
        found: String,
    },

    /// A model field got an instance of another type.
    #[error("Expected an instance of '{expected}', got {found}")]
    ModelMismatch {
        expected: String,
        found: String,
    },

    /// A poly field got a type outside its closed set.
    #[error("'{found}' is not one of the accepted types: {accepted}")]
    UnknownPolyType {
        found: String,
        accepted: String,
    },

    /// The reference has no id to point at.
    #[error("Referenced model does not have the {key} attribute")]
    MissingRefId {
        key: String,
    },

    /// The referenced key is unset or not an object id.
    #[error("Referenced model has an empty or invalid {key}")]
    InvalidRefId {
        key: String,
    },

    /// The model declares no such field.
    #[error("Unknown field '{name}'")]
    UnknownField {
        name: String,
    },

    /// A validator rejected the value.
    #[error("{message}")]
    Invalid {
        message: String,
    },

    /// A list item failed.
    #[error("item {index}: {source}")]
    Element {
        index: usize,
        source: Box<FieldError>,
    },

    /// A dict entry failed.
    #[error("key '{key}': {source}")]
    Entry {
        key: String,
        source: Box<FieldError>,
    },

    /// A field of a nested model failed.
    #[error("{model}.{field}: {source}")]
    Nested {
        model: String,
        field: String,
        source: Box<FieldError>,
    },
}

impl FieldError {
    /// Creates a free-form validator error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub(crate) fn coerce(expected: &'static str, found: impl Into<String>) -> Self {
        Self::Coerce {
            expected,
            found: found.into(),
        }
    }

    pub(crate) fn element(index: usize, source: Self) -> Self {
        Self::Element {
            index,
            source: Box::new(source),
        }
    }

    pub(crate) fn entry(key: impl Into<String>, source: Self) -> Self {
        Self::Entry {
            key: key.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn nested(model: impl Into<String>, field: impl Into<String>, source: Self) -> Self {
        Self::Nested {
            model: model.into(),
            field: field.into(),
            source: Box::new(source),
        }
    }
}

/// A field validator rejected a model value.
///
/// Validation halts at the first failing field; there is no collect-all mode.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{model}.{field} failed validation: {source}")]
pub struct ValidationError {
    /// Model type of the instance.
    pub model: String,
    /// Field that failed.
    pub field: String,
    /// The field's own error.
    pub source: FieldError,
}

/// Schema or binding mistakes detected at declaration time.
///
/// These indicate a programming error and are never recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A persisted model needs a primary key.
    #[error("Model '{model}' does not declare a primary key")]
    MissingPrimaryKey {
        model: String,
    },

    /// Only one field may be the primary key.
    #[error("Model '{model}' declares more than one primary key ('{first}', '{second}')")]
    DuplicatePrimaryKey {
        model: String,
        first: String,
        second: String,
    },

    /// A required field cannot also have a default.
    #[error("Field '{model}.{field}' is required and cannot also declare a default")]
    RequiredWithDefault {
        model: String,
        field: String,
    },

    /// A derived value shares a field's name.
    #[error("Derived value '{name}' of '{model}' collides with a field of the same name")]
    DerivedNameCollision {
        model: String,
        name: String,
    },

    /// A poly field needs at least one model type.
    #[error("Poly field '{model}.{field}' declares no model types")]
    EmptyPolyTypes {
        model: String,
        field: String,
    },

    /// A poly field lists a model type twice.
    #[error("Poly field '{model}.{field}' declares model type '{name}' more than once")]
    DuplicatePolyType {
        model: String,
        field: String,
        name: String,
    },

    /// An excluded field is not declared.
    #[error("Model '{model}' excludes unknown field '{field}'")]
    UnknownExcludedField {
        model: String,
        field: String,
    },

    /// A configuration value is out of range.
    #[error("Invalid setting '{setting}': {reason}")]
    InvalidSetting {
        setting: String,
        reason: String,
    },
}

/// A signal receiver returned an error.
#[derive(Debug, Error)]
#[error("Receiver '{receiver}' failed: {error:#}")]
pub struct SignalError {
    /// Name of the failing receiver.
    pub receiver: String,
    /// What the receiver returned.
    pub error: anyhow::Error,
}

/// Top-level error type for tbone.
#[derive(Debug, Error)]
pub enum TboneError {
    /// A field value could not be converted.
    #[error("Cannot convert '{model}.{field}': {source}")]
    Coercion {
        model: String,
        field: String,
        source: FieldError,
    },

    /// A model failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The store call failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A declaration or setting is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A signal receiver failed.
    #[error(transparent)]
    Signal(#[from] SignalError),

    /// A field operation failed outside a model.
    #[error("Field error: {0}")]
    Field(#[from] FieldError),

    /// The operation needs the instance's primary key value.
    #[error("'{model}' instance has no primary key value")]
    MissingPrimaryKeyValue {
        model: String,
    },

    /// An invariant was broken.
    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl TboneError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attributes an unattributed field error to `model.field`.
    #[must_use]
    pub fn attribute(self, model: &str, field: &str) -> Self {
        match self {
            Self::Field(source) => Self::Coercion {
                model: model.to_string(),
                field: field.to_string(),
                source,
            },
            other => other,
        }
    }

    /// Returns true if this is a coercion error.
    #[must_use]
    pub const fn is_coercion(&self) -> bool {
        matches!(self, Self::Coercion { .. } | Self::Field(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a store error.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if repeating the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for tbone operations.
pub type TboneResult<T> = Result<T, TboneError>;
