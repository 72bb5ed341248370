//! Field validators.
//!
//! A validator is a named pure check over a native value. Built-in checks
//! (ranges, sizes, choices, address formats) and user-supplied ones share the
//! same type so a field keeps a single ordered chain. `Null` values never
//! reach a validator; the required check handles them.

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::{ConfigError, FieldError};
use crate::value::Value;

const EMAIL_PATTERN: &str = r"(?i)^[_a-z0-9+-]+(\.[_a-z0-9+-]+)*@[a-z0-9-]+(\.[a-z0-9-]+)*\.[a-z]{2,}$";
const URL_PATTERN: &str = r"(?i)^[a-z][a-z0-9+.-]*://[^\s/?#@]+(:\d+)?([/?#]\S*)?$";

static EMAIL_RE: OnceLock<Option<Regex>> = OnceLock::new();
static URL_RE: OnceLock<Option<Regex>> = OnceLock::new();

type CheckFn = Arc<dyn Fn(&Value) -> Result<(), FieldError> + Send + Sync>;

/// A named check over a native value.
#[derive(Clone)]
pub struct Validator {
    name: Cow<'static, str>,
    check: CheckFn,
}

impl Validator {
    /// Wraps a check returning a typed error.
    pub fn new<F>(name: impl Into<Cow<'static, str>>, check: F) -> Self
    where
        F: Fn(&Value) -> Result<(), FieldError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Wraps a check that reports failures as plain messages.
    pub fn custom<F>(name: impl Into<Cow<'static, str>>, check: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::new(name, move |value| check(value).map_err(FieldError::invalid))
    }

    /// Name reported for the validator.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the check.
    ///
    /// # Errors
    ///
    /// Returns the validator's `FieldError` when the value is rejected.
    pub fn check(&self, value: &Value) -> Result<(), FieldError> {
        (self.check)(value)
    }

    /// Numbers must be at least `min`.
    #[must_use]
    pub fn min(min: f64) -> Self {
        Self::new("min", move |value| match value.as_float() {
            Some(v) if v < min => Err(FieldError::Min { min }),
            _ => Ok(()),
        })
    }

    /// Numbers must be at most `max`.
    #[must_use]
    pub fn max(max: f64) -> Self {
        Self::new("max", move |value| match value.as_float() {
            Some(v) if v > max => Err(FieldError::Max { max }),
            _ => Ok(()),
        })
    }

    /// Lists and dicts must hold at least `min` entries.
    #[must_use]
    pub fn min_size(min: usize) -> Self {
        Self::new("min_size", move |value| match collection_len(value) {
            Some(len) if len < min => Err(FieldError::MinSize { min }),
            _ => Ok(()),
        })
    }

    /// Lists and dicts must hold at most `max` entries.
    #[must_use]
    pub fn max_size(max: usize) -> Self {
        Self::new("max_size", move |value| match collection_len(value) {
            Some(len) if len > max => Err(FieldError::MaxSize { max }),
            _ => Ok(()),
        })
    }

    /// Value must equal one of `choices`.
    #[must_use]
    pub fn choices(choices: Vec<Value>) -> Self {
        let listed = choices
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Self::new("choices", move |value| {
            if choices.contains(value) {
                Ok(())
            } else {
                Err(FieldError::Choice {
                    choices: listed.clone(),
                })
            }
        })
    }

    /// Strings must be well-formed email addresses. Empty strings pass.
    #[must_use]
    pub fn email() -> Self {
        Self::new("email", |value| {
            matches_builtin(&EMAIL_RE, EMAIL_PATTERN, value, "Malformed email address")
        })
    }

    /// Strings must be absolute URLs with a scheme and host. Empty strings pass.
    #[must_use]
    pub fn url() -> Self {
        Self::new("url", |value| {
            matches_builtin(&URL_RE, URL_PATTERN, value, "Malformed URL")
        })
    }

    /// Strings must match `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if the pattern does not compile.
    pub fn pattern(pattern: &str) -> Result<Self, ConfigError> {
        let re = Regex::new(pattern).map_err(|e| ConfigError::InvalidSetting {
            setting: "validator.pattern".to_string(),
            reason: format!("invalid regex '{pattern}': {e}"),
        })?;
        let message = format!("Value does not match '{pattern}'");
        Ok(Self::new("pattern", move |value| match value.as_str() {
            Some(s) if !re.is_match(s) => Err(FieldError::invalid(message.clone())),
            _ => Ok(()),
        }))
    }
}

fn collection_len(value: &Value) -> Option<usize> {
    match value {
        Value::List(items) => Some(items.len()),
        Value::Dict(entries) => Some(entries.len()),
        _ => None,
    }
}

fn matches_builtin(
    cell: &OnceLock<Option<Regex>>,
    pattern: &str,
    value: &Value,
    message: &str,
) -> Result<(), FieldError> {
    let Some(s) = value.as_str().filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let re = cell
        .get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .ok_or_else(|| FieldError::invalid(format!("pattern unavailable: {pattern}")))?;
    if re.is_match(s) {
        Ok(())
    } else {
        Err(FieldError::invalid(message))
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Validator").field(&self.name).finish()
    }
}
