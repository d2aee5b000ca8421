//! Header-only access to raw message parts.
//!
//! Routing decisions only need `msg_id` and `msg_type`, so headers are read
//! without touching `content` or buffers. Rewrites go through a generic JSON
//! object so that fields this crate does not know about survive untouched.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::WireError;

/// The routing-relevant fields of a header (or parent header).
///
/// Both fields default to empty strings, which is what an empty parent
/// header (`{}`) deserializes to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HeaderRef {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub msg_type: String,
}

impl HeaderRef {
    /// The message id, or `None` for an empty parent header.
    pub fn msg_id(&self) -> Option<&str> {
        if self.msg_id.is_empty() {
            None
        } else {
            Some(&self.msg_id)
        }
    }
}

/// Deserialize only the routing fields of a header part.
///
/// `null` is accepted and treated like `{}`, since some frontends send a
/// null parent header.
pub fn peek_header(part: &[u8]) -> Result<HeaderRef, WireError> {
    let value: Option<HeaderRef> = serde_json::from_slice(part)?;
    Ok(value.unwrap_or_default())
}

/// Rewrite the `msg_id` field of a header part.
///
/// `f` receives the current id and returns the replacement, or `None` to
/// leave the part as is. Parts without a string `msg_id` are returned
/// unchanged.
pub fn rewrite_msg_id<F>(part: &Bytes, f: F) -> Result<Bytes, WireError>
where
    F: FnOnce(&str) -> Option<String>,
{
    let mut header: Map<String, Value> = match serde_json::from_slice::<Value>(part)? {
        Value::Object(map) => map,
        _ => return Ok(part.clone()),
    };

    let replacement = match header.get("msg_id") {
        Some(Value::String(id)) => f(id),
        _ => None,
    };

    match replacement {
        Some(new_id) => {
            header.insert("msg_id".to_string(), Value::String(new_id));
            Ok(Bytes::from(serde_json::to_vec(&header)?))
        }
        None => Ok(part.clone()),
    }
}

/// Parse a JSON part into a value, mapping an empty part to `{}`.
pub fn parse_part(part: &[u8]) -> Result<Value, WireError> {
    if part.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    Ok(serde_json::from_slice(part)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_header() {
        let part = br#"{"msg_id":"shell:abc","msg_type":"kernel_info_request","session":"s","username":"u","date":"2025-05-14T14:32:23.490Z","version":"5.3"}"#;
        let header = peek_header(part).unwrap();
        assert_eq!(header.msg_id, "shell:abc");
        assert_eq!(header.msg_type, "kernel_info_request");
    }

    #[test]
    fn test_peek_empty_parent_header() {
        let header = peek_header(b"{}").unwrap();
        assert!(header.msg_id().is_none());

        let header = peek_header(b"null").unwrap();
        assert!(header.msg_id().is_none());
    }

    #[test]
    fn test_peek_rejects_garbage() {
        assert!(peek_header(b"not json").is_err());
    }

    #[test]
    fn test_rewrite_preserves_other_fields() {
        let part = Bytes::from_static(
            br#"{"msg_id":"abc","msg_type":"execute_request","session":"s1","extra":{"k":1}}"#,
        );
        let rewritten = rewrite_msg_id(&part, |id| Some(format!("shell:{}", id))).unwrap();
        let value: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["msg_id"], "shell:abc");
        assert_eq!(value["session"], "s1");
        assert_eq!(value["extra"]["k"], 1);
    }

    #[test]
    fn test_rewrite_noop_keeps_bytes() {
        let part = Bytes::from_static(br#"{"msg_id":"abc"}"#);
        let rewritten = rewrite_msg_id(&part, |_| None).unwrap();
        assert_eq!(rewritten, part);

        let no_id = Bytes::from_static(b"{}");
        let rewritten = rewrite_msg_id(&no_id, |_| Some("x".into())).unwrap();
        assert_eq!(rewritten, no_id);
    }
}
