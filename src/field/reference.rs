//! Conversions for reference fields.
//!
//! A reference names a document in another collection by its object id.
//! Values held by a reference field resolve from a `DbRef`, an instance of
//! the referenced model, or a `{ref, id}` mapping.

use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use super::json_type_name;
use crate::error::FieldError;
use crate::model::{Model, Schema};
use crate::object_id::{DbRef, ObjectId};
use crate::value::{ref_to_json, NativeMap, Value};

// Key the referenced id travels under when no primary key names it.
const ID_KEY: &str = "_id";

fn missing_id(key: &str) -> FieldError {
    FieldError::MissingRefId {
        key: key.to_string(),
    }
}

fn invalid_id(key: &str) -> FieldError {
    FieldError::InvalidRefId {
        key: key.to_string(),
    }
}

fn parse_id(value: &Value) -> Option<ObjectId> {
    match value {
        Value::ObjectId(id) => Some(*id),
        Value::String(hex) => ObjectId::parse_str(hex).ok(),
        _ => None,
    }
}

fn from_model(collection: &str, schema: &Schema, model: &Model) -> Result<DbRef, FieldError> {
    if model.schema().id() != schema.id() {
        return Err(FieldError::ModelMismatch {
            expected: schema.name().to_string(),
            found: model.name().to_string(),
        });
    }
    let key = schema.primary_key().ok_or_else(|| missing_id(ID_KEY))?;
    let id = model
        .get(key)
        .and_then(parse_id)
        .ok_or_else(|| invalid_id(key))?;
    Ok(DbRef::new(collection, id))
}

fn from_wire_mapping(map: &Map<String, JsonValue>) -> Result<DbRef, FieldError> {
    let collection = map
        .get("ref")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| FieldError::invalid("Reference has no 'ref' collection name"))?;
    let id = match map.get("id") {
        None | Some(JsonValue::Null) => return Err(missing_id("id")),
        Some(JsonValue::String(hex)) => ObjectId::parse_str(hex).map_err(|_| invalid_id("id"))?,
        Some(_) => return Err(invalid_id("id")),
    };
    Ok(DbRef::new(collection, id))
}

fn from_native_mapping(entries: &NativeMap) -> Result<DbRef, FieldError> {
    let collection = entries
        .get("ref")
        .and_then(Value::as_str)
        .ok_or_else(|| FieldError::invalid("Reference has no 'ref' collection name"))?;
    let id = match entries.get("id") {
        None | Some(Value::Null) => return Err(missing_id("id")),
        Some(value) => parse_id(value).ok_or_else(|| invalid_id("id"))?,
    };
    Ok(DbRef::new(collection, id))
}

pub(super) fn import_ref(wire: &JsonValue) -> Result<Value, FieldError> {
    let JsonValue::Object(map) = wire else {
        return Err(FieldError::NotAMapping {
            found: json_type_name(wire).to_string(),
        });
    };
    from_wire_mapping(map).map(Value::Ref)
}

/// Resolves a value held by a reference field into the reference it names.
pub(super) fn resolve_ref(collection: &str, schema: &Arc<Schema>, value: &Value) -> Result<DbRef, FieldError> {
    match value {
        Value::Ref(reference) => Ok(reference.clone()),
        Value::Model(model) => from_model(collection, schema, model),
        Value::Dict(entries) => from_native_mapping(entries),
        Value::Json(JsonValue::Object(map)) => from_wire_mapping(map),
        other => Err(FieldError::coerce("reference", other.type_name())),
    }
}

pub(super) fn export_ref(collection: &str, schema: &Arc<Schema>, value: &Value) -> Result<JsonValue, FieldError> {
    resolve_ref(collection, schema, value).map(|reference| ref_to_json(&reference))
}

pub(super) fn validate_ref(collection: &str, schema: &Arc<Schema>, value: &Value) -> Result<(), FieldError> {
    resolve_ref(collection, schema, value).map(drop)
}
