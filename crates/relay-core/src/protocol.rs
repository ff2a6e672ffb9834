//! Wire codec for the batched message protocol.
//!
//! A batch is a JSON array of envelopes, each envelope a tuple
//! `[key, value]` or `[key, value, token]`, sent as one text frame.
//! The empty string is not a batch: it is the reserved heartbeat
//! probe/ack marker and decodes to its own outcome.

use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;

/// Key reserved for callback-response envelopes. Application events
/// must never use it.
pub const CALLBACK_KEY: &str = "";

/// The reserved zero-length heartbeat frame.
pub const HEARTBEAT_FRAME: &str = "";

/// One (key, value, optional callback token) message unit.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub key: String,
    pub value: Value,
    pub token: Option<u32>,
}

impl Envelope {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            token: None,
        }
    }

    pub fn with_token(key: impl Into<String>, value: Value, token: u32) -> Self {
        Self {
            key: key.into(),
            value,
            token: Some(token),
        }
    }

    /// A `""`-keyed envelope answering the request that carried `token`.
    /// The peer looks up the token in its callback table and invokes the
    /// stored handler with `value`.
    pub fn callback_response(token: u32, value: Value) -> Self {
        Self {
            key: CALLBACK_KEY.to_string(),
            value: Value::Array(vec![Value::from(token), value]),
            token: None,
        }
    }

    /// Interpret this envelope as a callback response, yielding the
    /// token it answers and the response value.
    pub fn as_callback_response(&self) -> Option<(u32, Value)> {
        if self.key != CALLBACK_KEY {
            return None;
        }
        let parts = self.value.as_array()?;
        let token = u32::try_from(parts.first()?.as_u64()?).ok()?;
        let value = parts.get(1).cloned().unwrap_or(Value::Null);
        Some((token, value))
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.token.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.key)?;
        seq.serialize_element(&self.value)?;
        if let Some(token) = self.token {
            seq.serialize_element(&token)?;
        }
        seq.end()
    }
}

/// Outcome of decoding one inbound transport frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    /// The reserved empty payload: heartbeat probe or ack.
    Heartbeat,
    /// A batch of raw envelope values. Elements are validated
    /// individually with [`parse_envelope`] so one malformed envelope
    /// does not discard its siblings.
    Batch(Vec<Value>),
    /// Unparseable or non-array payload. Never fatal; the caller counts
    /// it and keeps the connection alive.
    Garbage,
}

/// Decode an inbound text frame into one of the three wire outcomes.
pub fn decode(raw: &str) -> Decoded {
    if raw.is_empty() {
        return Decoded::Heartbeat;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => Decoded::Batch(items),
        _ => Decoded::Garbage,
    }
}

/// Validate one batch element as an envelope. `None` classifies the
/// element as garbage.
pub fn parse_envelope(item: &Value) -> Option<Envelope> {
    let parts = item.as_array()?;
    let key = parts.first()?.as_str()?.to_string();
    let value = parts.get(1).cloned().unwrap_or(Value::Null);
    let token = match parts.get(2) {
        Some(t) => Some(u32::try_from(t.as_u64()?).ok()?),
        None => None,
    };
    Some(Envelope { key, value, token })
}

/// Serialize a batch of envelopes into a single text frame.
pub fn encode_batch<'a, I>(envelopes: I) -> String
where
    I: IntoIterator<Item = &'a Envelope>,
{
    let items: Vec<&Envelope> = envelopes.into_iter().collect();
    // Envelope serialization is infallible: keys are strings and values
    // are already JSON.
    serde_json::to_string(&items).unwrap_or_else(|_| "[]".to_string())
}
