//! NIP-01 wire messages.
//!
//! Every frame is a JSON array whose first element names the message type.
//! Decoding happens in two phases: the array and its string tag are checked
//! first, then the payload is decoded according to that tag.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::{
    event::Event,
    filter::{Filter, FilterError},
};

/// Per-message decode failures. None of them terminate a connection.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("malformed filter: {0}")]
    MalformedFilter(#[from] FilterError),
    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(String),
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Event),
    /// `["REQ", <subscription id>, <filter>, ...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", <subscription id>]`
    Close { subscription_id: String },
}

/// Messages sent by the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription id>, <event>]`, or `["EVENT", <event>]` for a
    /// direct reply that belongs to no subscription.
    Event {
        subscription_id: Option<String>,
        event: Arc<Event>,
    },
    /// `["EOSE", <subscription id>]`
    Eose { subscription_id: String },
    /// `["NOTICE", <message>]`
    Notice { message: String },
    /// `["OK", <event id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
}

impl ClientMessage {
    /// Decode a raw text frame.
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        let val: Value = serde_json::from_str(frame)
            .map_err(|e| CodecError::MalformedFrame(format!("invalid JSON: {e}")))?;
        let arr = val
            .as_array()
            .ok_or_else(|| CodecError::MalformedFrame("expected a JSON array".into()))?;
        let tag = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::MalformedFrame("missing message type".into()))?;
        match tag {
            "EVENT" => {
                if arr.len() != 2 {
                    return Err(CodecError::MalformedFrame(
                        "EVENT takes exactly one event".into(),
                    ));
                }
                let event = serde_json::from_value(arr[1].clone())
                    .map_err(|e| CodecError::MalformedEvent(e.to_string()))?;
                Ok(Self::Event(event))
            }
            "REQ" => {
                if arr.len() < 3 {
                    return Err(CodecError::MalformedFrame(
                        "REQ needs a subscription id and at least one filter".into(),
                    ));
                }
                let subscription_id = subscription_id(&arr[1])?;
                let filters = arr[2..]
                    .iter()
                    .map(Filter::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => {
                if arr.len() != 2 {
                    return Err(CodecError::MalformedFrame(
                        "CLOSE takes exactly one subscription id".into(),
                    ));
                }
                Ok(Self::Close {
                    subscription_id: subscription_id(&arr[1])?,
                })
            }
            other => Err(CodecError::UnsupportedMessageType(other.to_string())),
        }
    }

    /// Encode to a text frame, as a client would send it.
    #[cfg(test)]
    pub fn encode(&self) -> String {
        let val = match self {
            Self::Event(event) => serde_json::json!(["EVENT", event]),
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![Value::from("REQ"), Value::from(subscription_id.as_str())];
                arr.extend(filters.iter().map(Filter::to_value));
                Value::Array(arr)
            }
            Self::Close { subscription_id } => serde_json::json!(["CLOSE", subscription_id]),
        };
        val.to_string()
    }
}

impl RelayMessage {
    /// Encode to a text frame.
    pub fn encode(&self) -> String {
        let val = match self {
            Self::Event {
                subscription_id: Some(sub),
                event,
            } => serde_json::json!(["EVENT", sub, event.as_ref()]),
            Self::Event {
                subscription_id: None,
                event,
            } => serde_json::json!(["EVENT", event.as_ref()]),
            Self::Eose { subscription_id } => serde_json::json!(["EOSE", subscription_id]),
            Self::Notice { message } => serde_json::json!(["NOTICE", message]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => serde_json::json!(["OK", event_id, accepted, message]),
        };
        val.to_string()
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
        }
    }
}

fn subscription_id(val: &Value) -> Result<String, CodecError> {
    match val.as_str() {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        Some(_) => Err(CodecError::MalformedFrame("empty subscription id".into())),
        None => Err(CodecError::MalformedFrame(
            "subscription id must be a string".into(),
        )),
    }
}
