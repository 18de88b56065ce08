//! Declared parameter schemas and the runtime parameter bundle.
//!
//! Strategies declare a [`ParameterSpec`] per knob; user-supplied values are
//! coerced and bounds-checked against the schema before a strategy instance
//! is built, so strategies themselves read from an already-validated
//! [`Params`] bundle through typed accessors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Int,
    Float,
    Str,
    Bool,
}

/// A single scalar parameter value.
///
/// Untagged serde representation, so `{"fast": 10, "pct": 0.5, "on": true}`
/// deserializes naturally. Variant order matters: bools before ints before
/// floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Str(_) => ParamKind::Str,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

/// Schema entry for one declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub kind: ParamKind,
    pub default: ParamValue,
    pub description: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub choices: Option<Vec<String>>,
}

impl ParameterSpec {
    pub fn int(default: i64, description: &str) -> Self {
        Self {
            kind: ParamKind::Int,
            default: ParamValue::Int(default),
            description: description.to_string(),
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn float(default: f64, description: &str) -> Self {
        Self {
            kind: ParamKind::Float,
            default: ParamValue::Float(default),
            description: description.to_string(),
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn boolean(default: bool, description: &str) -> Self {
        Self {
            kind: ParamKind::Bool,
            default: ParamValue::Bool(default),
            description: description.to_string(),
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn string(default: &str, description: &str) -> Self {
        Self {
            kind: ParamKind::Str,
            default: ParamValue::Str(default.to_string()),
            description: description.to_string(),
            min: None,
            max: None,
            choices: None,
        }
    }

    pub fn bounded(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = Some(choices.iter().map(|c| (*c).to_string()).collect());
        self
    }

    /// Coerce `value` to this spec's kind and check bounds/choices.
    pub fn coerce(&self, name: &str, value: &ParamValue) -> Result<ParamValue, ConfigError> {
        let invalid = |detail: String| ConfigError::InvalidParameter {
            name: name.to_string(),
            detail,
        };

        let coerced = match self.kind {
            ParamKind::Int => ParamValue::Int(
                value
                    .as_int()
                    .ok_or_else(|| invalid(format!("expected int, got {value:?}")))?,
            ),
            ParamKind::Float => ParamValue::Float(
                value
                    .as_float()
                    .ok_or_else(|| invalid(format!("expected float, got {value:?}")))?,
            ),
            ParamKind::Bool => ParamValue::Bool(
                value
                    .as_bool()
                    .ok_or_else(|| invalid(format!("expected bool, got {value:?}")))?,
            ),
            ParamKind::Str => ParamValue::Str(
                value
                    .as_str()
                    .ok_or_else(|| invalid(format!("expected string, got {value:?}")))?
                    .to_string(),
            ),
        };

        if let Some(numeric) = coerced.as_float() {
            if let Some(min) = self.min {
                if numeric < min {
                    return Err(invalid(format!("{numeric} below minimum {min}")));
                }
            }
            if let Some(max) = self.max {
                if numeric > max {
                    return Err(invalid(format!("{numeric} above maximum {max}")));
                }
            }
        }

        if let (Some(choices), Some(s)) = (&self.choices, coerced.as_str()) {
            if !choices.iter().any(|c| c == s) {
                return Err(invalid(format!("{s:?} not one of {choices:?}")));
            }
        }

        Ok(coerced)
    }
}

/// Validated parameter bundle handed to strategy constructors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) -> &mut Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn missing(name: &str) -> ConfigError {
        ConfigError::InvalidParameter {
            name: name.to_string(),
            detail: "missing".to_string(),
        }
    }

    pub fn get_int(&self, name: &str) -> Result<i64, ConfigError> {
        self.get(name)
            .and_then(ParamValue::as_int)
            .ok_or_else(|| Self::missing(name))
    }

    pub fn get_float(&self, name: &str) -> Result<f64, ConfigError> {
        self.get(name)
            .and_then(ParamValue::as_float)
            .ok_or_else(|| Self::missing(name))
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, ConfigError> {
        self.get(name)
            .and_then(ParamValue::as_bool)
            .ok_or_else(|| Self::missing(name))
    }

    pub fn get_str(&self, name: &str) -> Result<&str, ConfigError> {
        self.get(name)
            .and_then(ParamValue::as_str)
            .ok_or_else(|| Self::missing(name))
    }
}

impl FromIterator<(String, ParamValue)> for Params {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
