//! Wire envelopes: labelled JSON arrays exchanged over the WebSocket.
//!
//! Inbound (client to relay) and outbound (relay to client) envelopes are
//! separate tagged variants discriminated by the first array element; the
//! connection engine dispatches on them with a flat match.

use serde_json::{json, Value};

use super::filter::Filter;
use super::{Event, EventError, Id};

/// Maximum accepted subscription id length in bytes.
pub const MAX_SUB_ID_LEN: usize = 64;

/// Envelopes a client may send.
#[derive(Debug, Clone)]
pub enum ClientEnvelope {
    Event(Box<Event>),
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: String,
    },
    Auth(Box<Event>),
}

/// Envelopes the relay sends.
#[derive(Debug, Clone)]
pub enum RelayEnvelope {
    Event { sub_id: String, event: Box<Event> },
    Ok { id: Id, accepted: bool, reason: String },
    Eose { sub_id: String },
    Closed { sub_id: String, reason: String },
    Notice { message: String },
    Auth { challenge: String },
}

impl ClientEnvelope {
    /// Parse an inbound frame.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let value: Value = serde_json::from_str(text)?;
        let arr = value
            .as_array()
            .ok_or_else(|| EventError::Malformed("envelope is not an array".into()))?;
        let label = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::Malformed("envelope has no label".into()))?;
        match label {
            "EVENT" => {
                let event = event_at(arr, 1)?;
                Ok(ClientEnvelope::Event(Box::new(event)))
            }
            "REQ" => {
                let sub_id = sub_id_at(arr, 1)?;
                if arr.len() < 3 {
                    return Err(EventError::Malformed("REQ carries no filters".into()));
                }
                let mut filters = Vec::with_capacity(arr.len() - 2);
                for value in &arr[2..] {
                    filters.push(Filter::from_value(value)?);
                }
                Ok(ClientEnvelope::Req { sub_id, filters })
            }
            "CLOSE" => Ok(ClientEnvelope::Close {
                sub_id: sub_id_at(arr, 1)?,
            }),
            "AUTH" => {
                let event = event_at(arr, 1)?;
                Ok(ClientEnvelope::Auth(Box::new(event)))
            }
            other => Err(EventError::Malformed(format!(
                "unsupported envelope label {other:?}"
            ))),
        }
    }
}

impl RelayEnvelope {
    /// Serialize an outbound frame.
    pub fn to_frame(&self) -> String {
        let value = match self {
            RelayEnvelope::Event { sub_id, event } => {
                json!(["EVENT", sub_id, event])
            }
            RelayEnvelope::Ok {
                id,
                accepted,
                reason,
            } => json!(["OK", hex::encode(id), accepted, reason]),
            RelayEnvelope::Eose { sub_id } => json!(["EOSE", sub_id]),
            RelayEnvelope::Closed { sub_id, reason } => json!(["CLOSED", sub_id, reason]),
            RelayEnvelope::Notice { message } => json!(["NOTICE", message]),
            RelayEnvelope::Auth { challenge } => json!(["AUTH", challenge]),
        };
        value.to_string()
    }
}

fn event_at(arr: &[Value], index: usize) -> Result<Event, EventError> {
    let value = arr
        .get(index)
        .ok_or_else(|| EventError::Malformed("envelope carries no event".into()))?;
    Ok(serde_json::from_value(value.clone())?)
}

fn sub_id_at(arr: &[Value], index: usize) -> Result<String, EventError> {
    let sub_id = arr
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| EventError::Malformed("missing subscription id".into()))?;
    if sub_id.is_empty() || sub_id.len() > MAX_SUB_ID_LEN {
        return Err(EventError::Malformed(format!(
            "subscription id must be 1..={MAX_SUB_ID_LEN} bytes"
        )));
    }
    Ok(sub_id.to_string())
}
