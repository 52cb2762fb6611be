//! Socket frame codec.
//!
//! Inbound frames come in two shapes, both JSON:
//!
//! ```text
//! ["new_message", {"id": 1, "body": "hi"}]     tagged array: [name, data...]
//! {"type": "new_message", "data": {...}}       typed object: {type, data}
//! ```
//!
//! [`decode_frame`] normalizes both into an [`Event`] before anything else
//! sees them. A text message from the socket may carry several frames
//! separated by newlines; [`decode_records`] handles that split.
//!
//! Outbound frames are always tagged arrays `[action, data]`.
//!
//! There is no packet-type prefix in front of the JSON; a frame like `42[...]`
//! or a text `"2"` keepalive is not part of this protocol and is dropped as
//! malformed.

use serde::Deserialize;
use serde_json::Value;

use crate::event::{Event, EventKind};

/// Reasons a single frame could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Not valid JSON.
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    /// JSON, but neither a tagged array nor a typed object.
    #[error("unsupported frame shape: {0}")]
    Shape(&'static str),
}

/// Both accepted wire shapes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireFrame {
    /// `[name, data...]`
    Tagged(Vec<Value>),
    /// `{type, data}`
    Typed {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        data: Value,
    },
}

impl WireFrame {
    /// Split into wire name and payload.
    fn into_parts(self) -> Result<(String, Value), FrameError> {
        match self {
            Self::Typed { kind, data } => Ok((kind, data)),
            Self::Tagged(mut items) => {
                if items.is_empty() {
                    return Err(FrameError::Shape("empty array"));
                }
                let Value::String(name) = items.remove(0) else {
                    return Err(FrameError::Shape("array frame without event name"));
                };
                let payload = match items.len() {
                    0 => Value::Null,
                    1 => items.remove(0),
                    _ => Value::Array(items),
                };
                Ok((name, payload))
            }
        }
    }
}

/// Normalize an already-parsed JSON value.
///
/// `Ok(None)` means the frame was well formed but named a kind this client
/// does not recognize; such frames are dropped without complaint.
pub fn decode_value(value: Value) -> Result<Option<Event>, FrameError> {
    let frame: WireFrame = serde_json::from_value(value)?;
    let (name, payload) = frame.into_parts()?;
    match EventKind::from_wire(&name) {
        Some(kind) => Ok(Some(Event::new(kind, payload))),
        None => {
            log::trace!("Dropping frame with unrecognized kind '{}'", name);
            Ok(None)
        }
    }
}

/// Decode one text frame.
pub fn decode_frame(text: &str) -> Result<Option<Event>, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    decode_value(value)
}

/// Decode every newline-delimited frame in a socket text message.
///
/// Malformed frames are logged and skipped; the rest still decode in order.
pub fn decode_records(text: &str) -> Vec<Event> {
    text.split('\n')
        .map(str::trim)
        .filter(|record| !record.is_empty())
        .filter_map(|record| match decode_frame(record) {
            Ok(event) => event,
            Err(e) => {
                log::warn!(
                    "[Socket] Dropping malformed frame ({}): {}",
                    e,
                    record.chars().take(100).collect::<String>()
                );
                None
            }
        })
        .collect()
}

/// Encode an outbound action as `[action, data]`.
#[must_use]
pub fn encode_action(action: &str, data: &Value) -> String {
    Value::Array(vec![Value::String(action.to_string()), data.clone()]).to_string()
}
