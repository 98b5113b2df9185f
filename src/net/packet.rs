//! Wire packets carried by every transport

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::TransportError;

/// Anything that travels over a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    /// Named fire-and-forget message
    Message {
        name: String,
        #[serde(default)]
        data: Value,
    },
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

/// Outbound request waiting for exactly one response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: Uuid,
    pub src: String,
    pub dst: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub payload: Value,
}

/// Answer to a request, carrying either data or an error message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(id: Uuid, data: Value) -> Self {
        Self {
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl Packet {
    /// Build a named message from any serializable payload
    pub fn message<T: Serialize>(name: impl Into<String>, data: &T) -> Result<Self, TransportError> {
        Ok(Self::Message {
            name: name.into(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Message name, if this is a named message
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Message { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Decode the payload of a named message
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        match self {
            Self::Message { data, .. } => Ok(serde_json::from_value(data.clone())?),
            _ => Err(TransportError::UnexpectedPacket),
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }
}
