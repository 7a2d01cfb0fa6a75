//! Client/gateway WebSocket frames (spec §6): untyped JSON arrays whose
//! first element names the frame type, the same shape Nostr relays use on
//! the wire. `serde`'s untagged-enum machinery can't express a variable-
//! arity array like `["REQ", subId, filter, filter, ...]`, so both
//! directions parse/build through `serde_json::Value` explicitly.

use crate::event::NostrEvent;
use crate::filter::Filter;
use serde_json::Value;

/// Errors decoding a client frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("frame is empty")]
    Empty,
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
    #[error("malformed {0} frame: {1}")]
    Malformed(&'static str, String),
}

/// A frame sent by a client to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Event(NostrEvent),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
    Auth(Value),
    Ping(Value),
}

impl ClientFrame {
    /// Parses a single inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if `text` is not a JSON array, is empty, names
    /// an unrecognized frame type, or is missing required fields for its type.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|e| FrameError::Malformed("frame", e.to_string()))?;
        let Value::Array(mut items) = value else {
            return Err(FrameError::NotAnArray);
        };
        if items.is_empty() {
            return Err(FrameError::Empty);
        }
        let tag = items.remove(0);
        let Value::String(tag) = tag else {
            return Err(FrameError::Malformed("frame", "first element must be a string".into()));
        };

        match tag.as_str() {
            "EVENT" => {
                let event_value = items.into_iter().next().ok_or_else(|| {
                    FrameError::Malformed("EVENT", "missing event object".into())
                })?;
                let event: NostrEvent = serde_json::from_value(event_value)
                    .map_err(|e| FrameError::Malformed("EVENT", e.to_string()))?;
                Ok(Self::Event(event))
            }
            "REQ" => {
                if items.is_empty() {
                    return Err(FrameError::Malformed("REQ", "missing subscription id".into()));
                }
                let sub_id = match items.remove(0) {
                    Value::String(s) => s,
                    other => {
                        return Err(FrameError::Malformed(
                            "REQ",
                            format!("subscription id must be a string, got {other}"),
                        ))
                    }
                };
                let filters = items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Filter>, _>>()
                    .map_err(|e| FrameError::Malformed("REQ", e.to_string()))?;
                Ok(Self::Req { sub_id, filters })
            }
            "CLOSE" => {
                let sub_id = match items.into_iter().next() {
                    Some(Value::String(s)) => s,
                    _ => return Err(FrameError::Malformed("CLOSE", "missing subscription id".into())),
                };
                Ok(Self::Close { sub_id })
            }
            "AUTH" => Ok(Self::Auth(Value::Array(items))),
            "PING" => Ok(Self::Ping(Value::Array(items))),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }

    /// Renders this frame as the JSON-array text sent over the wire, the
    /// inverse of [`Self::parse`]. Used when a frame originally received
    /// from a client needs to be re-sent verbatim to a peer.
    #[must_use]
    pub fn to_text(&self) -> String {
        let value = match self {
            Self::Event(event) => Value::Array(vec![
                Value::String("EVENT".into()),
                serde_json::to_value(event).unwrap_or(Value::Null),
            ]),
            Self::Req { sub_id, filters } => {
                let mut items = vec![Value::String("REQ".into()), Value::String(sub_id.clone())];
                items.extend(filters.iter().map(|f| serde_json::to_value(f).unwrap_or(Value::Null)));
                Value::Array(items)
            }
            Self::Close { sub_id } => {
                Value::Array(vec![Value::String("CLOSE".into()), Value::String(sub_id.clone())])
            }
            Self::Auth(value) => {
                let mut items = vec![Value::String("AUTH".into())];
                if let Value::Array(inner) = value {
                    items.extend(inner.clone());
                } else {
                    items.push(value.clone());
                }
                Value::Array(items)
            }
            Self::Ping(value) => {
                let mut items = vec![Value::String("PING".into())];
                if let Value::Array(inner) = value {
                    items.extend(inner.clone());
                } else {
                    items.push(value.clone());
                }
                Value::Array(items)
            }
        };
        value.to_string()
    }
}

/// A frame sent by the gateway to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Event { sub_id: String, event: NostrEvent },
    Eose { sub_id: String },
    Ok { event_id: String, accepted: bool, message: String },
    Notice { text: String },
    TokenRevoked { reason: Option<String>, sequence: u64 },
}

impl ServerFrame {
    /// Renders this frame as the JSON-array text sent over the WebSocket.
    #[must_use]
    pub fn to_text(&self) -> String {
        let value = match self {
            Self::Event { sub_id, event } => {
                Value::Array(vec![
                    Value::String("EVENT".into()),
                    Value::String(sub_id.clone()),
                    serde_json::to_value(event).unwrap_or(Value::Null),
                ])
            }
            Self::Eose { sub_id } => {
                Value::Array(vec![Value::String("EOSE".into()), Value::String(sub_id.clone())])
            }
            Self::Ok { event_id, accepted, message } => Value::Array(vec![
                Value::String("OK".into()),
                Value::String(event_id.clone()),
                Value::Bool(*accepted),
                Value::String(message.clone()),
            ]),
            Self::Notice { text } => {
                Value::Array(vec![Value::String("NOTICE".into()), Value::String(text.clone())])
            }
            Self::TokenRevoked { reason, sequence } => Value::Array(vec![
                Value::String("TOKEN".into()),
                Value::String("REVOKED".into()),
                serde_json::json!({ "reason": reason, "sequence": sequence }),
            ]),
        };
        value.to_string()
    }
}
