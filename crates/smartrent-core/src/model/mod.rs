// ── Domain model ──
//
// Device kinds are described by attribute schemas rather than by type; a
// new kind is a schema table, not a new code path.

pub mod attribute;
pub mod device;

pub use attribute::{
    AttributeChanges, AttributeSpec, AttributeValue, Attributes, FanMode, HvacMode,
    OperatingState, ValueType,
};
pub use device::{ChangeCause, DeviceChange, DeviceKind, DeviceSnapshot, DeviceSummary, attr};
