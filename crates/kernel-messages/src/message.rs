//! JSON form of kernel messages as exchanged with backends.
//!
//! Backends hand messages over as JSON documents where `content` is untyped
//! until `header.msg_type` is known and binary buffers travel as base64.

use base64::prelude::*;
use bytes::Bytes;
use jupyter_protocol::{Channel, Header, JupyterMessage, JupyterMessageContent};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Error type for message conversion failures.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Failed to parse message content: {0}")]
    ContentParseError(#[from] anyhow::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Incoming message before its content has been typed.
#[derive(Debug, Clone, Deserialize)]
pub struct RawJupyterMessage {
    pub header: Header,

    /// `{}`, `null` and a missing field all mean "no parent".
    #[serde(
        default,
        deserialize_with = "jupyter_protocol::deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default)]
    pub metadata: Value,

    pub content: Value,

    #[serde(default, deserialize_with = "deserialize_buffers")]
    pub buffers: Vec<Bytes>,

    #[serde(default)]
    pub channel: Option<Channel>,
}

impl TryFrom<RawJupyterMessage> for JupyterMessage {
    type Error = ConversionError;

    fn try_from(raw: RawJupyterMessage) -> Result<Self, Self::Error> {
        let content =
            JupyterMessageContent::from_type_and_content(&raw.header.msg_type, raw.content)?;

        Ok(JupyterMessage {
            zmq_identities: Vec::new(),
            header: raw.header,
            parent_header: raw.parent_header,
            metadata: raw.metadata,
            content,
            buffers: raw.buffers,
            channel: raw.channel,
        })
    }
}

/// Outgoing message: typed content, base64 buffers, no routing identities.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub header: Header,
    pub parent_header: Option<Header>,
    pub metadata: Value,
    pub content: JupyterMessageContent,

    #[serde(serialize_with = "serialize_buffers")]
    pub buffers: Vec<Bytes>,

    pub channel: Option<Channel>,
}

impl From<JupyterMessage> for OutboundMessage {
    fn from(msg: JupyterMessage) -> Self {
        OutboundMessage {
            header: msg.header,
            parent_header: msg.parent_header,
            metadata: msg.metadata,
            content: msg.content,
            buffers: msg.buffers,
            channel: msg.channel,
        }
    }
}

/// Parse a backend JSON message into a typed `JupyterMessage`.
pub fn parse_message(json: &str) -> Result<JupyterMessage, ConversionError> {
    let raw: RawJupyterMessage = serde_json::from_str(json)?;
    raw.try_into()
}

/// Parse a message that has already been decoded into a JSON value.
pub fn message_from_value(value: Value) -> Result<JupyterMessage, ConversionError> {
    let raw: RawJupyterMessage = serde_json::from_value(value)?;
    raw.try_into()
}

pub fn message_to_json(msg: &JupyterMessage) -> Result<String, ConversionError> {
    Ok(serde_json::to_string(&OutboundMessage::from(msg.clone()))?)
}

/// The `msg_id` of the request a message answers, if any.
pub fn parent_msg_id(msg: &JupyterMessage) -> Option<&str> {
    msg.parent_header.as_ref().map(|h| h.msg_id.as_str())
}

fn serialize_buffers<S>(data: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    data.iter()
        .map(|bytes| BASE64_STANDARD.encode(bytes))
        .collect::<Vec<_>>()
        .serialize(serializer)
}

/// `null` and a missing field both decode to no buffers.
fn deserialize_buffers<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<Vec<String>> = Option::deserialize(deserializer)?;
    encoded
        .unwrap_or_default()
        .iter()
        .map(|s| {
            BASE64_STANDARD
                .decode(s)
                .map(Bytes::from)
                .map_err(serde::de::Error::custom)
        })
        .collect()
}
