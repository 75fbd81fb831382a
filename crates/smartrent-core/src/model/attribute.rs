// ── Attribute values and schemas ──

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, VariantNames};

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Attribute name to value. Ordered so snapshots render deterministically.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A requested set of attribute writes.
pub type AttributeChanges = BTreeMap<String, AttributeValue>;

// ── Schema ───────────────────────────────────────────────────────────

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    Number,
    Text,
    /// A string restricted to the listed values.
    Enum(&'static [&'static str]),
}

impl ValueType {
    /// Coerce `value` into this type, if it is compatible.
    ///
    /// Integers are accepted for `Number` and whole floats for `Int`. NaN and
    /// infinities fit neither.
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    pub fn coerce(self, value: &AttributeValue) -> Option<AttributeValue> {
        match (self, value) {
            (Self::Bool, AttributeValue::Bool(_))
            | (Self::Int, AttributeValue::Int(_))
            | (Self::Text, AttributeValue::Text(_)) => Some(value.clone()),
            (Self::Number, AttributeValue::Number(n)) if n.is_finite() => Some(value.clone()),
            (Self::Number, AttributeValue::Int(_)) => value.as_f64().map(AttributeValue::Number),
            (Self::Int, AttributeValue::Number(n)) if n.is_finite() && n.fract().abs() < f64::EPSILON => {
                Some(AttributeValue::Int(*n as i64))
            }
            (Self::Enum(allowed), AttributeValue::Text(s)) if allowed.contains(&s.as_str()) => {
                Some(value.clone())
            }
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("integer"),
            Self::Number => f.write_str("number"),
            Self::Text => f.write_str("text"),
            Self::Enum(allowed) => write!(f, "one of {}", allowed.join("|")),
        }
    }
}

/// One entry in a device kind's attribute schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec {
    pub name: &'static str,
    pub value_type: ValueType,
    pub writable: bool,
}

impl AttributeSpec {
    pub(crate) const fn read_only(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name,
            value_type,
            writable: false,
        }
    }

    pub(crate) const fn writable(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name,
            value_type,
            writable: true,
        }
    }
}

// ── Thermostat enumerations ──────────────────────────────────────────

/// Thermostat operating mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr, VariantNames,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum HvacMode {
    Cool,
    Heat,
    Auto,
    Off,
}

/// Thermostat fan mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr, VariantNames,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum FanMode {
    On,
    Auto,
}

/// What the thermostat is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperatingState {
    Cooling,
    Heating,
    Idle,
    Off,
}
