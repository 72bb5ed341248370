//! Scalar field kinds and their wire conversions.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::FieldError;
use crate::object_id::ObjectId;
use crate::value::{format_date, format_datetime, format_time, Value};

const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y.%m.%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d", "%d.%m.%Y"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

// Largest magnitude an f64 can hold while still converting exactly to i64.
const I64_FLOAT_LIMIT: f64 = 9_007_199_254_740_992.0;

/// Scalar field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    /// Text.
    String,
    /// Integer.
    Integer,
    /// Floating point number.
    Float,
    /// Boolean.
    Boolean,
    /// UTC timestamp.
    DateTime,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Document identifier.
    ObjectId,
    /// UUID.
    Uuid,
    /// Email address.
    Email,
    /// URL.
    Url,
    /// Any JSON value, kept as is.
    FreeForm,
}

impl ScalarKind {
    /// Name of the wire (JSON) type.
    #[must_use]
    pub const fn wire_type(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "number",
            Self::Boolean => "boolean",
            Self::FreeForm => "any",
            Self::String
            | Self::DateTime
            | Self::Date
            | Self::Time
            | Self::ObjectId
            | Self::Uuid
            | Self::Email
            | Self::Url => "string",
        }
    }

    /// Name of the native type, matching `Value::type_name`.
    #[must_use]
    pub const fn native_type(self) -> &'static str {
        match self {
            Self::String | Self::Email | Self::Url => "string",
            Self::Integer => "int",
            Self::Float => "float",
            Self::Boolean => "bool",
            Self::DateTime => "datetime",
            Self::Date => "date",
            Self::Time => "time",
            Self::ObjectId => "object_id",
            Self::Uuid => "uuid",
            Self::FreeForm => "json",
        }
    }

    pub(crate) fn import(self, wire: &JsonValue) -> Result<Value, FieldError> {
        let imported = match self {
            Self::String | Self::Email | Self::Url => match wire {
                JsonValue::String(s) => Some(Value::String(s.clone())),
                JsonValue::Number(n) => Some(Value::String(n.to_string())),
                JsonValue::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            Self::Integer => import_int(wire).map(Value::Int),
            Self::Float => import_float(wire).map(Value::Float),
            Self::Boolean => import_bool(wire).map(Value::Bool),
            Self::DateTime => match wire {
                JsonValue::String(s) => parse_datetime(s),
                JsonValue::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
                _ => None,
            }
            .map(Value::DateTime),
            Self::Date => wire.as_str().and_then(parse_date).map(Value::Date),
            Self::Time => wire.as_str().and_then(parse_time).map(Value::Time),
            Self::ObjectId => wire
                .as_str()
                .and_then(|s| ObjectId::parse_str(s).ok())
                .map(Value::ObjectId),
            Self::Uuid => wire
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(Value::Uuid),
            Self::FreeForm => Some(Value::Json(wire.clone())),
        };
        imported.ok_or_else(|| FieldError::coerce(self.native_type(), describe(wire)))
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub(crate) fn export(self, value: &Value) -> Result<JsonValue, FieldError> {
        let exported = match (self, value) {
            (_, Value::Null) => Some(JsonValue::Null),
            (Self::String | Self::Email | Self::Url, Value::String(s)) => {
                Some(JsonValue::String(s.clone()))
            }
            (Self::Integer, Value::Int(n)) => Some(JsonValue::from(*n)),
            (Self::Integer, Value::Float(f)) if is_integral(*f) => Some(JsonValue::from(*f as i64)),
            (Self::Float, Value::Float(f)) => serde_json::Number::from_f64(*f).map(JsonValue::Number),
            (Self::Float, Value::Int(n)) => serde_json::Number::from_f64(*n as f64).map(JsonValue::Number),
            (Self::Boolean, Value::Bool(b)) => Some(JsonValue::Bool(*b)),
            (Self::DateTime, Value::DateTime(dt)) => Some(JsonValue::String(format_datetime(dt))),
            (Self::Date, Value::Date(d)) => Some(JsonValue::String(format_date(d))),
            (Self::Date, Value::DateTime(dt)) => {
                Some(JsonValue::String(format_date(&dt.date_naive())))
            }
            (Self::Time, Value::Time(t)) => Some(JsonValue::String(format_time(t))),
            (Self::ObjectId, Value::ObjectId(id)) => Some(JsonValue::String(id.to_hex())),
            (Self::Uuid, Value::Uuid(u)) => Some(JsonValue::String(u.to_string())),
            (Self::FreeForm, other) => other.to_json().ok(),
            _ => None,
        };
        exported.ok_or_else(|| FieldError::coerce(self.native_type(), value.type_name()))
    }
}

/// Name of a JSON value's type.
pub(crate) const fn json_type_name(wire: &JsonValue) -> &'static str {
    match wire {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn describe(wire: &JsonValue) -> String {
    match wire {
        JsonValue::String(s) => format!("'{s}'"),
        JsonValue::Number(n) => n.to_string(),
        other => json_type_name(other).to_string(),
    }
}

fn is_integral(f: f64) -> bool {
    f.is_finite() && f.fract() == 0.0 && f.abs() <= I64_FLOAT_LIMIT
}

#[allow(clippy::cast_possible_truncation)]
fn import_int(wire: &JsonValue) -> Option<i64> {
    match wire {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| is_integral(*f)).map(|f| f as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| is_integral(*f))
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn import_float(wire: &JsonValue) -> Option<f64> {
    match wire {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn import_bool(wire: &JsonValue) -> Option<bool> {
    match wire {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.as_str() {
            "True" | "true" | "1" => Some(true),
            "False" | "false" | "0" => Some(false),
            _ => None,
        },
        JsonValue::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    OFFSET_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            NAIVE_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        })
        .or_else(|| {
            parse_naive_date(s)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
}

fn parse_naive_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    parse_naive_date(s).or_else(|| parse_datetime(s).map(|dt| dt.date_naive()))
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(s, fmt).ok())
        .or_else(|| parse_datetime(s).map(|dt| dt.time()))
}
