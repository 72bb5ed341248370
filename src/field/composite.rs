//! Conversions for list, dict, model and poly fields.

use std::borrow::Cow;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{json, Value as JsonValue};

use super::{json_type_name, Field};
use crate::error::{FieldError, TboneResult};
use crate::model::{Model, Schema};
use crate::storage::Document;
use crate::value::{NativeMap, Value};

fn accepted_names(schemas: &[Arc<Schema>]) -> String {
    schemas
        .iter()
        .map(|s| s.name())
        .collect::<Vec<_>>()
        .join(", ")
}

fn not_a_list(found: &str) -> FieldError {
    FieldError::NotAList {
        found: found.to_string(),
    }
}

fn not_a_mapping(found: &str) -> FieldError {
    FieldError::NotAMapping {
        found: found.to_string(),
    }
}

fn ensure_schema(schema: &Schema, model: &Model) -> Result<(), FieldError> {
    if model.schema().id() == schema.id() {
        Ok(())
    } else {
        Err(FieldError::ModelMismatch {
            expected: schema.name().to_string(),
            found: model.name().to_string(),
        })
    }
}

fn find_schema<'a>(schemas: &'a [Arc<Schema>], model: &Model) -> Result<&'a Arc<Schema>, FieldError> {
    schemas
        .iter()
        .find(|s| s.id() == model.schema().id())
        .ok_or_else(|| FieldError::UnknownPolyType {
            found: model.name().to_string(),
            accepted: accepted_names(schemas),
        })
}

pub(super) fn import_list(inner: &Field, wire: &JsonValue) -> Result<Value, FieldError> {
    let JsonValue::Array(items) = wire else {
        return Err(not_a_list(json_type_name(wire)));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| inner.import(item).map_err(|e| FieldError::element(i, e)))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::List)
}

pub(super) fn export_list(inner: &Field, value: &Value) -> Result<JsonValue, FieldError> {
    let Value::List(items) = value else {
        return Err(not_a_list(value.type_name()));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| inner.export(item).map_err(|e| FieldError::element(i, e)))
        .collect::<Result<Vec<_>, _>>()
        .map(JsonValue::Array)
}

pub(super) fn validate_list(inner: &Field, value: &Value) -> Result<(), FieldError> {
    let Value::List(items) = value else {
        return Err(not_a_list(value.type_name()));
    };
    for (i, item) in items.iter().enumerate() {
        inner.validate(item).map_err(|e| FieldError::element(i, e))?;
    }
    Ok(())
}

pub(super) fn import_dict(inner: &Field, wire: &JsonValue) -> Result<Value, FieldError> {
    let JsonValue::Object(entries) = wire else {
        return Err(not_a_mapping(json_type_name(wire)));
    };
    let mut out = NativeMap::with_capacity(entries.len());
    for (key, item) in entries {
        let value = inner.import(item).map_err(|e| FieldError::entry(key, e))?;
        out.insert(key.clone(), value);
    }
    Ok(Value::Dict(out))
}

pub(super) fn export_dict(inner: &Field, value: &Value) -> Result<JsonValue, FieldError> {
    let Value::Dict(entries) = value else {
        return Err(not_a_mapping(value.type_name()));
    };
    let mut out = Document::new();
    for (key, item) in entries {
        let wire = inner.export(item).map_err(|e| FieldError::entry(key, e))?;
        out.insert(key.clone(), wire);
    }
    Ok(JsonValue::Object(out))
}

pub(super) fn validate_dict(inner: &Field, value: &Value) -> Result<(), FieldError> {
    let Value::Dict(entries) = value else {
        return Err(not_a_mapping(value.type_name()));
    };
    for (key, item) in entries {
        inner.validate(item).map_err(|e| FieldError::entry(key, e))?;
    }
    Ok(())
}

pub(super) fn import_model(schema: &Arc<Schema>, wire: &JsonValue) -> Result<Value, FieldError> {
    let JsonValue::Object(data) = wire else {
        return Err(not_a_mapping(json_type_name(wire)));
    };
    Model::import_nested(schema, data).map(Value::from)
}

/// Resolves a model field value into an instance: an instance of the bound
/// schema is borrowed, a raw mapping is converted into a new instance.
fn resolve_model<'a>(schema: &Arc<Schema>, value: &'a Value) -> Result<Cow<'a, Model>, FieldError> {
    match value {
        Value::Model(model) => {
            ensure_schema(schema, model)?;
            Ok(Cow::Borrowed(model.as_ref()))
        }
        Value::Dict(entries) => Model::from_native(schema, entries).map(Cow::Owned),
        Value::Json(JsonValue::Object(data)) => Model::import_nested(schema, data).map(Cow::Owned),
        other => Err(FieldError::ModelMismatch {
            expected: schema.name().to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

pub(super) fn export_model(schema: &Arc<Schema>, value: &Value) -> Result<JsonValue, FieldError> {
    let model = resolve_model(schema, value)?;
    model.export_nested().map(JsonValue::Object)
}

pub(super) fn validate_model(schema: &Arc<Schema>, value: &Value) -> Result<(), FieldError> {
    let model = resolve_model(schema, value)?;
    model
        .validate()
        .map_err(|e| FieldError::nested(e.model, e.field, e.source))
}

pub(super) fn import_poly(schemas: &[Arc<Schema>], wire: &JsonValue) -> Result<Value, FieldError> {
    let JsonValue::Object(tagged) = wire else {
        return Err(not_a_mapping(json_type_name(wire)));
    };
    let type_name = tagged
        .get("type")
        .and_then(JsonValue::as_str)
        .unwrap_or("<missing>");
    let schema = schemas
        .iter()
        .find(|s| s.name() == type_name)
        .ok_or_else(|| FieldError::UnknownPolyType {
            found: type_name.to_string(),
            accepted: accepted_names(schemas),
        })?;
    match tagged.get("data") {
        Some(JsonValue::Object(data)) => Model::import_nested(schema, data).map(Value::from),
        Some(other) => Err(not_a_mapping(json_type_name(other))),
        None => Err(not_a_mapping("null")),
    }
}

pub(super) fn export_poly(schemas: &[Arc<Schema>], value: &Value) -> Result<JsonValue, FieldError> {
    let Value::Model(model) = value else {
        return Err(FieldError::ModelMismatch {
            expected: accepted_names(schemas),
            found: value.type_name().to_string(),
        });
    };
    let schema = find_schema(schemas, model)?;
    let data = model.export_nested()?;
    Ok(json!({"type": schema.name(), "data": data}))
}

pub(super) fn validate_poly(schemas: &[Arc<Schema>], value: &Value) -> Result<(), FieldError> {
    let Value::Model(model) = value else {
        return Err(FieldError::ModelMismatch {
            expected: accepted_names(schemas),
            found: value.type_name().to_string(),
        });
    };
    find_schema(schemas, model)?;
    model
        .validate()
        .map_err(|e| FieldError::nested(e.model, e.field, e.source))
}

pub(super) async fn serialize_list(inner: &Field, items: &[Value]) -> TboneResult<JsonValue> {
    let outcomes = join_all(items.iter().map(|item| inner.serialize(item))).await;
    outcomes
        .into_iter()
        .collect::<TboneResult<Vec<_>>>()
        .map(JsonValue::Array)
}

pub(super) async fn serialize_dict(inner: &Field, entries: &NativeMap) -> TboneResult<JsonValue> {
    let outcomes = join_all(entries.values().map(|item| inner.serialize(item))).await;
    let mut out = Document::new();
    for (key, outcome) in entries.keys().zip(outcomes) {
        out.insert(key.clone(), outcome?);
    }
    Ok(JsonValue::Object(out))
}

pub(super) async fn serialize_model(schema: &Arc<Schema>, model: &Model) -> TboneResult<JsonValue> {
    ensure_schema(schema, model)?;
    model.serialize().await.map(JsonValue::Object)
}

pub(super) async fn serialize_poly(schemas: &[Arc<Schema>], model: &Model) -> TboneResult<JsonValue> {
    let schema = find_schema(schemas, model)?;
    let data = model.serialize().await?;
    Ok(json!({"type": schema.name(), "data": data}))
}
