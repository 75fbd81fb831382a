// Realtime socket frames
//
// JSON text frames tagged by `type`. Outbound frames carry a `ref` that the
// server echoes back in the matching `ack` or `error`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::devices::flexible_id;
use crate::error::Error;

/// Raw attribute map as it appears on the wire.
pub type WireAttributes = BTreeMap<String, Value>;

/// Frame types this crate knows how to decode.
const KNOWN_TYPES: &[&str] = &["event", "snapshot", "ack", "error", "control"];

/// Bearer token embedded in the `auth` frame. Redacted in `Debug` output.
#[derive(Clone, Serialize)]
#[serde(transparent)]
pub struct FrameToken(String);

impl FrameToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for FrameToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameToken([REDACTED])")
    }
}

// ── Outbound ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Auth {
        #[serde(rename = "ref")]
        reference: String,
        token: FrameToken,
    },
    Subscribe {
        #[serde(rename = "ref")]
        reference: String,
        device_ids: Vec<String>,
    },
    /// Ask for full snapshots of the listed devices.
    Sync {
        #[serde(rename = "ref")]
        reference: String,
        device_ids: Vec<String>,
    },
    Command {
        #[serde(rename = "ref")]
        reference: String,
        device_id: String,
        attributes: WireAttributes,
    },
}

impl OutboundFrame {
    pub fn reference(&self) -> &str {
        match self {
            Self::Auth { reference, .. }
            | Self::Subscribe { reference, .. }
            | Self::Sync { reference, .. }
            | Self::Command { reference, .. } => reference,
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Protocol {
            message: format!("failed to encode frame: {e}"),
        })
    }
}

// ── Inbound ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlEvent {
    Heartbeat,
    /// The server is about to drop the connection.
    Close,
    /// The server wants a fresh `auth` frame on the existing connection.
    Reauthenticate,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Event {
        #[serde(deserialize_with = "flexible_id")]
        device_id: String,
        version: u64,
        #[serde(default)]
        attributes: WireAttributes,
    },
    Snapshot {
        #[serde(deserialize_with = "flexible_id")]
        device_id: String,
        kind: String,
        #[serde(default)]
        name: Option<String>,
        version: u64,
        #[serde(default)]
        attributes: WireAttributes,
    },
    Ack {
        #[serde(rename = "ref")]
        reference: String,
        #[serde(default, deserialize_with = "optional_flexible_id")]
        device_id: Option<String>,
        #[serde(default)]
        version: Option<u64>,
        #[serde(default)]
        attributes: Option<WireAttributes>,
    },
    Error {
        #[serde(rename = "ref", default)]
        reference: Option<String>,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        reason: String,
    },
    Control {
        event: ControlEvent,
        #[serde(default)]
        reason: Option<String>,
    },
    /// A well-formed frame of a type this crate does not handle.
    #[serde(skip_deserializing)]
    Unknown { frame_type: String },
}

/// Error code the server uses when the bearer token has expired.
pub const CODE_TOKEN_EXPIRED: &str = "token_expired";
/// Error code the server uses when the credentials are not accepted.
pub const CODE_UNAUTHORIZED: &str = "unauthorized";

impl InboundFrame {
    /// Decode one text frame.
    ///
    /// Frames that are not JSON objects with a string `type`, or whose body
    /// does not match the declared type, are protocol errors. Unknown types
    /// decode to [`InboundFrame::Unknown`].
    pub fn decode(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text).map_err(|e| Error::Protocol {
            message: format!("invalid JSON: {e}"),
        })?;

        let Some(frame_type) = value.get("type").and_then(Value::as_str) else {
            return Err(Error::Protocol {
                message: "frame has no `type` field".into(),
            });
        };

        if !KNOWN_TYPES.contains(&frame_type) {
            return Ok(Self::Unknown {
                frame_type: frame_type.to_owned(),
            });
        }

        let frame_type = frame_type.to_owned();
        serde_json::from_value(value).map_err(|e| Error::Protocol {
            message: format!("bad `{frame_type}` frame: {e}"),
        })
    }

    pub fn frame_type(&self) -> &str {
        match self {
            Self::Event { .. } => "event",
            Self::Snapshot { .. } => "snapshot",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
            Self::Control { .. } => "control",
            Self::Unknown { frame_type } => frame_type,
        }
    }
}

fn optional_flexible_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "flexible_id")] String);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(id)| id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn encodes_command_with_ref() {
        let frame = OutboundFrame::Command {
            reference: "c-1".into(),
            device_id: "lock-1".into(),
            attributes: BTreeMap::from([("locked".to_owned(), json!(true))]),
        };
        let encoded: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({
                "type": "command",
                "ref": "c-1",
                "device_id": "lock-1",
                "attributes": { "locked": true }
            })
        );
    }

    #[test]
    fn auth_token_is_redacted_in_debug() {
        let frame = OutboundFrame::Auth {
            reference: "a".into(),
            token: FrameToken::new("super-secret"),
        };
        assert!(!format!("{frame:?}").contains("super-secret"));
        assert!(frame.encode().unwrap().contains("super-secret"));
    }

    #[test]
    fn decodes_event_with_numeric_id() {
        let frame =
            InboundFrame::decode(r#"{"type":"event","device_id":17,"version":3,"attributes":{"locked":false}}"#)
                .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Event {
                device_id: "17".into(),
                version: 3,
                attributes: BTreeMap::from([("locked".to_owned(), json!(false))]),
            }
        );
    }

    #[test]
    fn decodes_bare_ack() {
        let frame = InboundFrame::decode(r#"{"type":"ack","ref":"x"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Ack {
                reference: "x".into(),
                device_id: None,
                version: None,
                attributes: None,
            }
        );
    }

    #[test]
    fn unknown_control_event_is_tolerated() {
        let frame = InboundFrame::decode(r#"{"type":"control","event":"maintenance"}"#).unwrap();
        assert!(matches!(
            frame,
            InboundFrame::Control {
                event: ControlEvent::Other,
                ..
            }
        ));
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let frame = InboundFrame::decode(r#"{"type":"presence","who":"me"}"#).unwrap();
        assert_eq!(frame.frame_type(), "presence");
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        for text in ["not json", r#"{"no_type":1}"#, r#"{"type":"event","device_id":"a"}"#] {
            assert!(
                matches!(InboundFrame::decode(text), Err(Error::Protocol { .. })),
                "{text}"
            );
        }
    }
}
