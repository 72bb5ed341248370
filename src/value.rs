//! Native values held by model instances.
//!
//! Fields convert between the wire form (`serde_json::Value`) and these
//! native values. Composite fields nest them: lists, string-keyed
//! dictionaries and whole model instances.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::TboneResult;
use crate::model::Model;
use crate::object_id::{DbRef, ObjectId};

/// Ordered string-keyed map of native values.
pub type NativeMap = IndexMap<String, Value>;

/// A native field value.
///
/// # Examples
///
/// ```
/// use tbone::Value;
///
/// let count = Value::from(3);
/// let label = Value::from("hats");
///
/// assert!(count.is_int());
/// assert_eq!(label.as_str(), Some("hats"));
/// assert!(Value::default().is_null());
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// No value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    String(String),
    /// UTC timestamp.
    DateTime(DateTime<Utc>),
    /// Calendar date.
    Date(NaiveDate),
    /// Time of day.
    Time(NaiveTime),
    /// Document identifier.
    ObjectId(ObjectId),
    /// UUID.
    Uuid(Uuid),
    /// Reference to a document in another collection.
    Ref(DbRef),
    /// Free-form JSON kept as is.
    Json(JsonValue),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed mapping in insertion order.
    Dict(NativeMap),
    /// Nested model instance.
    Model(Box<Model>),
}

impl Value {
    /// True for `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True for `Bool`.
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    /// True for `Int`.
    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    /// True for `Float`.
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    /// True for `String`.
    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    /// True for `List`.
    pub const fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    /// True for `Dict`.
    pub const fn is_dict(&self) -> bool {
        matches!(self, Self::Dict(_))
    }

    /// True for `Model`.
    pub const fn is_model(&self) -> bool {
        matches!(self, Self::Model(_))
    }

    /// The boolean, if this is one.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The integer, if this is one.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to floats.
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The text, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// The timestamp, if this is one.
    pub const fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTime(v) => Some(*v),
            _ => None,
        }
    }

    /// The date, if this is one.
    pub const fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(v) => Some(*v),
            _ => None,
        }
    }

    /// The time of day, if this is one.
    pub const fn as_time(&self) -> Option<NaiveTime> {
        match self {
            Self::Time(v) => Some(*v),
            _ => None,
        }
    }

    /// The object id, if this is one.
    pub const fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Self::ObjectId(v) => Some(*v),
            _ => None,
        }
    }

    /// The UUID, if this is one.
    pub const fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    /// The reference, if this is one.
    pub const fn as_db_ref(&self) -> Option<&DbRef> {
        match self {
            Self::Ref(v) => Some(v),
            _ => None,
        }
    }

    /// The free-form JSON, if this is one.
    pub const fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// The items, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable items, if this is a list.
    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// The entries, if this is a dict.
    pub const fn as_dict(&self) -> Option<&NativeMap> {
        match self {
            Self::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable entries, if this is a dict.
    pub fn as_dict_mut(&mut self) -> Option<&mut NativeMap> {
        match self {
            Self::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// The instance, if this is a model.
    pub fn as_model(&self) -> Option<&Model> {
        match self {
            Self::Model(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable instance, if this is a model.
    pub fn as_model_mut(&mut self) -> Option<&mut Model> {
        match self {
            Self::Model(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the type name as a string.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::DateTime(_) => "datetime",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::ObjectId(_) => "object_id",
            Self::Uuid(_) => "uuid",
            Self::Ref(_) => "ref",
            Self::Json(_) => "json",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Model(_) => "model",
        }
    }

    /// Untyped wire form of the value.
    ///
    /// Used where no field declaration drives the conversion, such as
    /// derived values. Model instances export through their schema.
    pub fn to_json(&self) -> TboneResult<JsonValue> {
        Ok(match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v).map_or(JsonValue::Null, JsonValue::Number),
            Self::String(v) => JsonValue::String(v.clone()),
            Self::DateTime(v) => JsonValue::String(format_datetime(v)),
            Self::Date(v) => JsonValue::String(format_date(v)),
            Self::Time(v) => JsonValue::String(format_time(v)),
            Self::ObjectId(v) => JsonValue::String(v.to_hex()),
            Self::Uuid(v) => JsonValue::String(v.to_string()),
            Self::Ref(v) => ref_to_json(v),
            Self::Json(v) => v.clone(),
            Self::List(items) => JsonValue::Array(items.iter().map(Self::to_json).collect::<TboneResult<_>>()?),
            Self::Dict(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_json()?);
                }
                JsonValue::Object(map)
            }
            Self::Model(model) => JsonValue::Object(model.export_data()?),
        })
    }
}

pub(crate) fn ref_to_json(reference: &DbRef) -> JsonValue {
    serde_json::json!({"ref": reference.collection, "id": reference.id.to_hex()})
}

pub(crate) fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn format_date(value: &NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

pub(crate) fn format_time(value: &NaiveTime) -> String {
    value.format("%H:%M:%S%.f").to_string()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "\"{v}\""),
            Self::DateTime(v) => write!(f, "{}", format_datetime(v)),
            Self::Date(v) => write!(f, "{}", format_date(v)),
            Self::Time(v) => write!(f, "{}", format_time(v)),
            Self::ObjectId(v) => write!(f, "ObjectId({v})"),
            Self::Uuid(v) => write!(f, "{v}"),
            Self::Ref(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
            Self::List(items) => write!(f, "[{} items]", items.len()),
            Self::Dict(entries) => write!(f, "{{{} entries}}", entries.len()),
            Self::Model(model) => write!(f, "{model}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Self::Time(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Self::ObjectId(v)
    }
}

impl From<DbRef> for Value {
    fn from(v: DbRef) -> Self {
        Self::Ref(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl From<Model> for Value {
    fn from(v: Model) -> Self {
        Self::Model(Box::new(v))
    }
}

impl From<NativeMap> for Value {
    fn from(v: NativeMap) -> Self {
        Self::Dict(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::from(42).as_int(), Some(42));
        assert_eq!(Value::from(42).as_float(), Some(42.0));
        assert_eq!(Value::from(2.5).as_float(), Some(2.5));
        assert_eq!(Value::from("hello").as_str(), Some("hello"));
        assert_eq!(Value::from(42).as_str(), None);
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::from(vec![1, 2]).type_name(), "list");
        assert_eq!(Value::from(ObjectId::new()).type_name(), "object_id");
        assert_eq!(Value::from(json!({"a": 1})).type_name(), "json");
    }

    #[test]
    fn test_value_from_option() {
        assert!(Value::from(None::<i64>).is_null());
        assert_eq!(Value::from(Some("x")), Value::from("x"));
    }

    #[test]
    fn test_value_to_json_scalars() {
        let at = Utc.with_ymd_and_hms(2017, 7, 25, 12, 34, 14).unwrap();
        assert_eq!(Value::from(at).to_json().unwrap(), json!("2017-07-25T12:34:14Z"));

        let date = NaiveDate::from_ymd_opt(2017, 1, 1).unwrap();
        assert_eq!(Value::from(date).to_json().unwrap(), json!("2017-01-01"));

        let time = NaiveTime::from_hms_opt(21, 34, 0).unwrap();
        assert_eq!(Value::from(time).to_json().unwrap(), json!("21:34:00"));

        assert_eq!(Value::Float(f64::NAN).to_json().unwrap(), JsonValue::Null);

        let id = ObjectId::parse_str("596e2cb1a0e1f1a2b3c4d5e6").unwrap();
        let reference = Value::from(DbRef::new("authors", id));
        assert_eq!(reference.type_name(), "ref");
        assert_eq!(
            reference.to_json().unwrap(),
            json!({"ref": "authors", "id": "596e2cb1a0e1f1a2b3c4d5e6"})
        );
    }

    #[test]
    fn test_value_to_json_nested() {
        let mut entries = NativeMap::new();
        entries.insert("b".to_string(), Value::from(vec![1, 2]));
        entries.insert("a".to_string(), Value::Null);

        let json = Value::Dict(entries).to_json().unwrap();
        assert_eq!(json, json!({"b": [1, 2], "a": null}));
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["b", "a"]);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::from(7).to_string(), "7");
        assert_eq!(Value::from("x").to_string(), "\"x\"");
        assert_eq!(Value::from(vec![1, 2, 3]).to_string(), "[3 items]");
    }
}
