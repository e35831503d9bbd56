//! The wire unit exchanged between processes and its newline-delimited codec.
//!
//! One [`Message`] is one compact JSON object followed by a single `\n`.
//! The payload convention is fixed: `payload` carries a raw JSON value
//! embedded directly in the envelope and is omitted entirely when absent.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::FabricError;

/// Discriminant carried in the `type` field of every [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Request,
    Response,
    Error,
    Event,
}

/// A single fabric message.
///
/// `id` carries the method name on requests and is echoed on replies; waiters
/// are keyed on `correlation_id` only, never on `id`. Routing uses `target`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Message {
    /// Builds an outbound REQUEST. A `Value::Null` payload is treated as absent.
    pub fn request(
        method: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            kind: MessageType::Request,
            id: method.into(),
            correlation_id: String::new(),
            source: source.into(),
            target: target.into(),
            payload: payload.filter(|value| !value.is_null()),
            error: String::new(),
        }
    }

    /// Builds a RESPONSE to `req`: echoes `id` and `correlation_id`, swaps
    /// `source`/`target`.
    pub fn success_reply(req: &Message, payload: Option<Value>) -> Self {
        Self {
            kind: MessageType::Response,
            id: req.id.clone(),
            correlation_id: req.correlation_id.clone(),
            source: req.target.clone(),
            target: req.source.clone(),
            payload: payload.filter(|value| !value.is_null()),
            error: String::new(),
        }
    }

    /// Builds an ERROR reply to `req` with empty payload.
    pub fn error_reply(req: &Message, text: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            id: req.id.clone(),
            correlation_id: req.correlation_id.clone(),
            source: req.target.clone(),
            target: req.source.clone(),
            payload: None,
            error: text.into(),
        }
    }

    /// Builds a fire-and-forget EVENT.
    pub fn event(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            kind: MessageType::Event,
            id: id.into(),
            correlation_id: String::new(),
            source: source.into(),
            target: target.into(),
            payload: payload.filter(|value| !value.is_null()),
            error: String::new(),
        }
    }

    /// Returns the error text when this reply is an ERROR.
    pub fn is_error(&self) -> Option<&str> {
        (self.kind == MessageType::Error).then_some(self.error.as_str())
    }
}

/// Encodes one message as compact JSON terminated by `\n`.
///
/// serde_json's compact form never emits a raw newline (newlines inside
/// strings are escaped), so the line framing holds for any payload.
pub fn encode_line(msg: &Message) -> Result<String, FabricError> {
    let mut line = serde_json::to_string(msg).map_err(FabricError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one framed line. Unknown fields are ignored; missing optional
/// fields default to empty.
pub fn decode_line(line: &str) -> Result<Message, FabricError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    serde_json::from_str(line).map_err(FabricError::Decode)
}

/// Decodes `msg.payload` into a caller-supplied type.
pub fn unmarshal_payload<T: DeserializeOwned>(msg: &Message) -> Result<T, FabricError> {
    let payload = msg.payload.as_ref().ok_or(FabricError::MissingPayload)?;
    serde_json::from_value(payload.clone()).map_err(FabricError::PayloadDecode)
}

/// Marshals a value into the payload representation.
pub fn marshal_payload<T: Serialize>(value: &T) -> Result<Value, FabricError> {
    serde_json::to_value(value).map_err(FabricError::PayloadEncode)
}

/// Returns the named field of a JSON object payload, or `MissingField`.
pub fn require_field<'a>(payload: &'a Value, name: &str) -> Result<&'a Value, FabricError> {
    payload
        .get(name)
        .filter(|value| !value.is_null())
        .ok_or_else(|| FabricError::MissingField(name.to_string()))
}

/// Returns the named field as a non-empty string, or `MissingField`.
pub fn require_str_field<'a>(payload: &'a Value, name: &str) -> Result<&'a str, FabricError> {
    require_field(payload, name)?
        .as_str()
        .filter(|text| !text.is_empty())
        .ok_or_else(|| FabricError::MissingField(name.to_string()))
}
