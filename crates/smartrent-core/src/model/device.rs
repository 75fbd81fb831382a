// ── Device domain types ──

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, VariantNames};

use super::attribute::{
    AttributeChanges, AttributeSpec, AttributeValue, Attributes, FanMode, HvacMode,
    OperatingState, ValueType,
};
use crate::error::CoreError;

/// Attribute names shared by the schemas and the typed helpers.
pub mod attr {
    pub const LOCKED: &str = "locked";
    pub const BATTERY_LEVEL: &str = "battery_level";
    pub const ONLINE: &str = "online";
    pub const MODE: &str = "mode";
    pub const FAN_MODE: &str = "fan_mode";
    pub const COOLING_SETPOINT: &str = "cooling_setpoint";
    pub const HEATING_SETPOINT: &str = "heating_setpoint";
    pub const CURRENT_TEMP: &str = "current_temp";
    pub const CURRENT_HUMIDITY: &str = "current_humidity";
    pub const OPERATING_STATE: &str = "operating_state";
}

const OPERATING_STATES: &[&str] = &["cooling", "heating", "idle", "off"];

const LOCK_SCHEMA: &[AttributeSpec] = &[
    AttributeSpec::writable(attr::LOCKED, ValueType::Bool),
    AttributeSpec::read_only(attr::BATTERY_LEVEL, ValueType::Int),
    AttributeSpec::read_only(attr::ONLINE, ValueType::Bool),
];

const THERMOSTAT_SCHEMA: &[AttributeSpec] = &[
    AttributeSpec::writable(attr::MODE, ValueType::Enum(HvacMode::VARIANTS)),
    AttributeSpec::writable(attr::FAN_MODE, ValueType::Enum(FanMode::VARIANTS)),
    AttributeSpec::writable(attr::COOLING_SETPOINT, ValueType::Number),
    AttributeSpec::writable(attr::HEATING_SETPOINT, ValueType::Number),
    AttributeSpec::read_only(attr::CURRENT_TEMP, ValueType::Number),
    AttributeSpec::read_only(attr::CURRENT_HUMIDITY, ValueType::Number),
    AttributeSpec::read_only(attr::OPERATING_STATE, ValueType::Enum(OPERATING_STATES)),
    AttributeSpec::read_only(attr::ONLINE, ValueType::Bool),
];

/// Supported device kinds. Each kind is defined entirely by its schema.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, VariantNames,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DeviceKind {
    Lock,
    Thermostat,
}

impl DeviceKind {
    pub fn schema(self) -> &'static [AttributeSpec] {
        match self {
            Self::Lock => LOCK_SCHEMA,
            Self::Thermostat => THERMOSTAT_SCHEMA,
        }
    }

    pub fn spec(self, name: &str) -> Option<&'static AttributeSpec> {
        self.schema().iter().find(|s| s.name == name)
    }

    /// Map a wire kind or REST device type to a supported kind.
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "lock" | smartrent_api::devices::LOCK_TYPE => Some(Self::Lock),
            smartrent_api::devices::THERMOSTAT_TYPE => Some(Self::Thermostat),
            _ => None,
        }
    }

    /// Guess the kind of a device from attribute names alone, using the
    /// first name that belongs to exactly one schema.
    pub fn infer<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        names.into_iter().find_map(|name| {
            match (Self::Lock.spec(name), Self::Thermostat.spec(name)) {
                (Some(_), None) => Some(Self::Lock),
                (None, Some(_)) => Some(Self::Thermostat),
                _ => None,
            }
        })
    }

    /// Check a write against the schema and coerce values to their declared
    /// types.
    pub fn validate_change(self, changes: &AttributeChanges) -> Result<AttributeChanges, CoreError> {
        if changes.is_empty() {
            return Err(CoreError::invalid("no attributes to change"));
        }

        changes
            .iter()
            .map(|(name, value)| {
                let spec = self
                    .spec(name)
                    .ok_or_else(|| CoreError::invalid(format!("unknown attribute `{name}` for {self}")))?;
                if !spec.writable {
                    return Err(CoreError::invalid(format!("`{name}` is read-only")));
                }
                let coerced = spec.value_type.coerce(value).ok_or_else(|| {
                    CoreError::invalid(format!("`{name}` expects {}, got {value}", spec.value_type))
                })?;
                Ok((name.clone(), coerced))
            })
            .collect()
    }
}

// ── Snapshots ────────────────────────────────────────────────────────

/// Immutable view of one device at a point in time.
///
/// `attributes` is the effective state: confirmed values with any in-flight
/// command values layered on top. Names in `pending` are still awaiting
/// acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub kind: DeviceKind,
    pub name: Option<String>,
    pub version: u64,
    pub attributes: Attributes,
    pub pending: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains(name)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn online(&self) -> Option<bool> {
        self.get(attr::ONLINE).and_then(AttributeValue::as_bool)
    }

    // ── Lock ─────────────────────────────────────────────────────────

    pub fn locked(&self) -> Option<bool> {
        self.get(attr::LOCKED).and_then(AttributeValue::as_bool)
    }

    pub fn battery_level(&self) -> Option<i64> {
        self.get(attr::BATTERY_LEVEL).and_then(AttributeValue::as_i64)
    }

    // ── Thermostat ───────────────────────────────────────────────────

    pub fn mode(&self) -> Option<HvacMode> {
        self.text_as(attr::MODE)
    }

    pub fn fan_mode(&self) -> Option<FanMode> {
        self.text_as(attr::FAN_MODE)
    }

    pub fn operating_state(&self) -> Option<OperatingState> {
        self.text_as(attr::OPERATING_STATE)
    }

    pub fn cooling_setpoint(&self) -> Option<f64> {
        self.get(attr::COOLING_SETPOINT).and_then(AttributeValue::as_f64)
    }

    pub fn heating_setpoint(&self) -> Option<f64> {
        self.get(attr::HEATING_SETPOINT).and_then(AttributeValue::as_f64)
    }

    pub fn current_temp(&self) -> Option<f64> {
        self.get(attr::CURRENT_TEMP).and_then(AttributeValue::as_f64)
    }

    pub fn current_humidity(&self) -> Option<f64> {
        self.get(attr::CURRENT_HUMIDITY).and_then(AttributeValue::as_f64)
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.id.clone(),
            kind: self.kind,
            name: self.name.clone(),
            online: self.online(),
            version: self.version,
            pending: !self.pending.is_empty(),
        }
    }

    fn text_as<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name)
            .and_then(AttributeValue::as_str)
            .and_then(|s| s.parse().ok())
    }
}

/// Compact listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub id: String,
    pub kind: DeviceKind,
    pub name: Option<String>,
    pub online: Option<bool>,
    pub version: u64,
    /// Whether any command is still awaiting acknowledgement.
    pub pending: bool,
}

// ── Change notifications ─────────────────────────────────────────────

/// Why a device snapshot was republished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeCause {
    /// A server push event.
    Event,
    /// A full snapshot, from subscribe, resync or refresh.
    Resync,
    /// A locally issued command, not yet acknowledged.
    Optimistic,
    /// The server acknowledged a command.
    Confirmed,
    /// A command failed and its optimistic values were dropped.
    Reverted,
}

/// Host notification for a device state change.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceChange {
    pub device_id: String,
    pub snapshot: Arc<DeviceSnapshot>,
    pub cause: ChangeCause,
}
