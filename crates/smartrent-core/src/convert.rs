// ── Wire ↔ domain conversion ──
//
// Socket frames carry loosely typed JSON attribute maps. Inbound maps are
// filtered through the device kind's schema; anything unknown or mistyped
// is dropped with a log line rather than failing the whole frame.

use serde_json::Value;
use smartrent_api::WireAttributes;
use tracing::{debug, trace};

use crate::model::{AttributeChanges, AttributeValue, Attributes, DeviceKind};

pub(crate) fn value_from_wire(value: &Value) -> Option<AttributeValue> {
    match value {
        Value::Bool(b) => Some(AttributeValue::Bool(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(AttributeValue::Int)
            .or_else(|| n.as_f64().map(AttributeValue::Number)),
        Value::String(s) => Some(AttributeValue::Text(s.clone())),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub(crate) fn value_to_wire(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Int(n) => Value::from(*n),
        AttributeValue::Number(n) => Value::from(*n),
        AttributeValue::Text(s) => Value::String(s.clone()),
    }
}

/// Keep the attributes `kind` declares, coerced to their declared types.
pub(crate) fn attributes_from_wire(
    kind: DeviceKind,
    device_id: &str,
    wire: &WireAttributes,
) -> Attributes {
    wire.iter()
        .filter_map(|(name, raw)| {
            let Some(spec) = kind.spec(name) else {
                trace!(device_id, attribute = %name, "ignoring attribute outside schema");
                return None;
            };
            let coerced = value_from_wire(raw).and_then(|v| spec.value_type.coerce(&v));
            if coerced.is_none() {
                debug!(device_id, attribute = %name, value = %raw, "dropping mistyped attribute");
            }
            coerced.map(|v| (name.clone(), v))
        })
        .collect()
}

pub(crate) fn changes_to_wire(changes: &AttributeChanges) -> WireAttributes {
    changes
        .iter()
        .map(|(name, value)| (name.clone(), value_to_wire(value)))
        .collect()
}
