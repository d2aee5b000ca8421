//! JSON text frames for frontends that do not negotiate a binary subprotocol.
//!
//! The frame is a single JSON object carrying every section of the message
//! plus the channel name:
//!
//! ```json
//! {"header": {...}, "parent_header": {...}, "metadata": {...},
//!  "content": {...}, "buffers": ["<base64>"], "channel": "shell"}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::base64::{deserialize_buffers, serialize_buffers};
use crate::header::parse_part;
use crate::{MessageParts, WireError, MIN_MESSAGE_PARTS};

/// A whole kernel message as sent in a JSON text frame.
///
/// Sections are kept as raw JSON values; only the relay's routing code looks
/// inside them, and only at the header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWireMessage {
    pub header: Value,

    #[serde(default = "empty_object", deserialize_with = "deserialize_object_or_null")]
    pub parent_header: Value,

    #[serde(default = "empty_object", deserialize_with = "deserialize_object_or_null")]
    pub metadata: Value,

    #[serde(default = "empty_object", deserialize_with = "deserialize_object_or_null")]
    pub content: Value,

    #[serde(
        default,
        serialize_with = "serialize_buffers",
        deserialize_with = "deserialize_buffers"
    )]
    pub buffers: Vec<Bytes>,

    #[serde(default)]
    pub channel: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// `null` sections become `{}` so that the resulting parts are valid headers.
fn deserialize_object_or_null<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Null) | None => empty_object(),
        Some(v) => v,
    })
}

impl JsonWireMessage {
    /// Build a text-frame message from raw kernel parts.
    pub fn from_parts(channel: &str, parts: &[Bytes]) -> Result<Self, WireError> {
        if parts.len() < MIN_MESSAGE_PARTS {
            return Err(WireError::TooFewParts(parts.len()));
        }
        Ok(JsonWireMessage {
            header: parse_part(&parts[0])?,
            parent_header: parse_part(&parts[1])?,
            metadata: parse_part(&parts[2])?,
            content: parse_part(&parts[3])?,
            buffers: parts[MIN_MESSAGE_PARTS..].to_vec(),
            channel: Some(channel.to_string()),
        })
    }

    /// Split into a channel name and raw kernel parts.
    pub fn into_parts(self) -> Result<(String, MessageParts), WireError> {
        let channel = self.channel.ok_or(WireError::MissingField("channel"))?;
        let mut parts = Vec::with_capacity(MIN_MESSAGE_PARTS + self.buffers.len());
        parts.push(Bytes::from(serde_json::to_vec(&self.header)?));
        parts.push(Bytes::from(serde_json::to_vec(&self.parent_header)?));
        parts.push(Bytes::from(serde_json::to_vec(&self.metadata)?));
        parts.push(Bytes::from(serde_json::to_vec(&self.content)?));
        parts.extend(self.buffers);
        Ok((channel, parts))
    }

    /// Parse a text frame.
    pub fn from_text(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Render as a text frame.
    pub fn to_text(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNEL_INFO: &str = r#"
    {
        "header": {
            "date": "2025-05-14T14:32:23.490Z",
            "msg_id": "test-id",
            "msg_type": "kernel_info_request",
            "session": "test-session",
            "username": "",
            "version": "5.2"
        },
        "parent_header": {},
        "metadata": {"cellId": "cell-1"},
        "content": {},
        "buffers": [],
        "channel": "shell"
    }
    "#;

    #[test]
    fn test_text_frame_to_parts() {
        let msg = JsonWireMessage::from_text(KERNEL_INFO).unwrap();
        let (channel, parts) = msg.into_parts().unwrap();
        assert_eq!(channel, "shell");
        assert_eq!(parts.len(), 4);

        let header = crate::peek_header(&parts[0]).unwrap();
        assert_eq!(header.msg_id, "test-id");
        assert_eq!(header.msg_type, "kernel_info_request");

        let metadata: Value = serde_json::from_slice(&parts[2]).unwrap();
        assert_eq!(metadata["cellId"], "cell-1");
    }

    #[test]
    fn test_null_parent_header() {
        let text = r#"{"header": {"msg_id": "x"}, "parent_header": null, "channel": "shell"}"#;
        let msg = JsonWireMessage::from_text(text).unwrap();
        assert_eq!(msg.parent_header, Value::Object(Map::new()));

        let (_, parts) = msg.into_parts().unwrap();
        assert_eq!(&parts[1][..], b"{}");
        assert_eq!(&parts[3][..], b"{}");
    }

    #[test]
    fn test_missing_channel() {
        let msg = JsonWireMessage::from_text(r#"{"header": {"msg_id": "x"}}"#).unwrap();
        assert!(matches!(
            msg.into_parts(),
            Err(WireError::MissingField("channel"))
        ));
    }

    #[test]
    fn test_from_parts_with_buffers() {
        let parts = vec![
            Bytes::from_static(br#"{"msg_id":"m","msg_type":"comm_msg"}"#),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{}"),
            Bytes::from_static(br#"{"data":{}}"#),
            Bytes::from_static(b"hello"),
        ];
        let msg = JsonWireMessage::from_parts("iopub", &parts).unwrap();
        let text = msg.to_text().unwrap();
        assert!(text.contains("aGVsbG8="));
        assert!(text.contains(r#""channel":"iopub""#));
    }

    #[test]
    fn test_from_parts_too_few() {
        let parts = vec![Bytes::from_static(b"{}")];
        assert!(matches!(
            JsonWireMessage::from_parts("shell", &parts),
            Err(WireError::TooFewParts(1))
        ));
    }
}
