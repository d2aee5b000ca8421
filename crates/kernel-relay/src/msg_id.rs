//! Routing metadata carried inside message ids.
//!
//! A message id may carry the channel it was sent on and an opaque source
//! id (a notebook cell id, for instance):
//!
//! ```text
//! {channel}:{base_id}#{src_id}
//! ```
//!
//! - `shell:a1b2c3_12345_0#cell-abc`: channel and source id
//! - `control:a1b2c3_12345_1`: channel only
//! - `a1b2c3_12345_2`: legacy id, no encoding
//!
//! Because kernels copy the request header into `parent_header` of every
//! reply and side effect, the encoding comes back for free and no table of
//! pending requests is needed.

use bytes::Bytes;
use kernel_wire::rewrite_msg_id;

const CHANNEL_SEPARATOR: char = ':';
const SRC_ID_SEPARATOR: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MsgIdError {
    #[error("invalid message id format: {0}")]
    InvalidFormat(String),

    #[error("channel name cannot contain ':': {0}")]
    InvalidChannel(String),

    #[error("source id cannot contain ':' or '#': {0}")]
    InvalidSrcId(String),
}

/// The components of a decoded message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMsgId {
    pub channel: Option<String>,
    pub src_id: Option<String>,
    pub base_id: String,
}

fn validate_channel(channel: Option<&str>) -> Result<(), MsgIdError> {
    match channel {
        Some(c) if c.contains(CHANNEL_SEPARATOR) => Err(MsgIdError::InvalidChannel(c.to_string())),
        _ => Ok(()),
    }
}

fn validate_src_id(src_id: Option<&str>) -> Result<(), MsgIdError> {
    match src_id {
        Some(s) if s.contains(CHANNEL_SEPARATOR) || s.contains(SRC_ID_SEPARATOR) => {
            Err(MsgIdError::InvalidSrcId(s.to_string()))
        }
        _ => Ok(()),
    }
}

/// Build a message id from a base id and optional channel / source id.
///
/// With neither given, `base_id` is returned unchanged.
pub fn encode(
    base_id: &str,
    channel: Option<&str>,
    src_id: Option<&str>,
) -> Result<String, MsgIdError> {
    validate_channel(channel)?;
    validate_src_id(src_id)?;

    let mut id = match channel {
        Some(channel) => format!("{}{}{}", channel, CHANNEL_SEPARATOR, base_id),
        None => base_id.to_string(),
    };
    if let Some(src_id) = src_id {
        id.push(SRC_ID_SEPARATOR);
        id.push_str(src_id);
    }
    Ok(id)
}

/// Split a message id into channel, source id and base id.
///
/// The source id is split off at the last `#`, then the channel at the
/// first `:` of what remains.
pub fn decode(msg_id: &str) -> Result<ParsedMsgId, MsgIdError> {
    if msg_id.is_empty() {
        return Err(MsgIdError::InvalidFormat(
            "message id cannot be empty".to_string(),
        ));
    }

    let (rest, src_id) = match msg_id.rsplit_once(SRC_ID_SEPARATOR) {
        Some((rest, src_id)) => (rest, Some(src_id.to_string())),
        None => (msg_id, None),
    };
    let (channel, base_id) = match rest.split_once(CHANNEL_SEPARATOR) {
        Some((channel, base_id)) => (Some(channel.to_string()), base_id.to_string()),
        None => (None, rest.to_string()),
    };

    Ok(ParsedMsgId {
        channel,
        src_id,
        base_id,
    })
}

pub fn extract_channel(msg_id: &str) -> Result<Option<String>, MsgIdError> {
    Ok(decode(msg_id)?.channel)
}

pub fn extract_src_id(msg_id: &str) -> Result<Option<String>, MsgIdError> {
    Ok(decode(msg_id)?.src_id)
}

pub fn extract_base_id(msg_id: &str) -> Result<String, MsgIdError> {
    Ok(decode(msg_id)?.base_id)
}

// ============================================================================
// Message-level helpers
// ============================================================================

/// Prefix the header's msg_id with `{channel}:`.
///
/// Idempotent: an id already carrying this channel prefix is left alone.
/// Parts whose header cannot be parsed are returned unchanged.
pub fn encode_channel_in_header(mut parts: Vec<Bytes>, channel: &str) -> Vec<Bytes> {
    let Some(header) = parts.first() else {
        return parts;
    };
    let prefix = format!("{}{}", channel, CHANNEL_SEPARATOR);
    match rewrite_msg_id(header, |id| {
        if id.starts_with(&prefix) {
            None
        } else {
            Some(format!("{}{}", prefix, id))
        }
    }) {
        Ok(rewritten) => parts[0] = rewritten,
        Err(e) => log::debug!("[msg-id] Could not encode channel in msg_id: {}", e),
    }
    parts
}

/// Append `#{src_id}` to the header's msg_id.
///
/// Ids that already carry a source id are left alone.
pub fn encode_src_id_in_header(
    mut parts: Vec<Bytes>,
    src_id: &str,
) -> Result<Vec<Bytes>, MsgIdError> {
    validate_src_id(Some(src_id))?;
    let Some(header) = parts.first() else {
        return Ok(parts);
    };
    match rewrite_msg_id(header, |id| {
        if id.contains(SRC_ID_SEPARATOR) {
            None
        } else {
            Some(format!("{}{}{}", id, SRC_ID_SEPARATOR, src_id))
        }
    }) {
        Ok(rewritten) => parts[0] = rewritten,
        Err(e) => log::debug!("[msg-id] Could not encode source id in msg_id: {}", e),
    }
    Ok(parts)
}

/// Reduce the msg_ids of header and parent header to their base ids.
///
/// Frontends only ever see ids in the form they generated them. Parts that
/// cannot be parsed are returned unchanged.
pub fn strip_encoding(mut parts: Vec<Bytes>) -> Vec<Bytes> {
    let strip = |id: &str| match decode(id) {
        Ok(parsed) if parsed.base_id != id => Some(parsed.base_id),
        _ => None,
    };
    for part in parts.iter_mut().take(2) {
        match rewrite_msg_id(part, strip) {
            Ok(rewritten) => *part = rewritten,
            Err(e) => log::debug!("[msg-id] Could not strip msg_id encoding: {}", e),
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts_with_ids(msg_id: &str, parent_id: Option<&str>) -> Vec<Bytes> {
        let header = serde_json::json!({"msg_id": msg_id, "msg_type": "status"});
        let parent = match parent_id {
            Some(id) => serde_json::json!({"msg_id": id, "msg_type": "execute_request"}),
            None => serde_json::json!({}),
        };
        vec![
            Bytes::from(serde_json::to_vec(&header).unwrap()),
            Bytes::from(serde_json::to_vec(&parent).unwrap()),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{}"),
        ]
    }

    fn header_id(part: &Bytes) -> String {
        kernel_wire::peek_header(part).unwrap().msg_id
    }

    #[test]
    fn test_encode_forms() {
        assert_eq!(
            encode("abc123_456_0", Some("shell"), Some("cell-xyz")).unwrap(),
            "shell:abc123_456_0#cell-xyz"
        );
        assert_eq!(
            encode("abc123_456_1", Some("control"), None).unwrap(),
            "control:abc123_456_1"
        );
        assert_eq!(
            encode("abc123_456_2", None, Some("cell")).unwrap(),
            "abc123_456_2#cell"
        );
    }

    #[test]
    fn test_legacy_passthrough() {
        assert_eq!(encode("abc", None, None).unwrap(), "abc");
        assert_eq!(
            decode("abc").unwrap(),
            ParsedMsgId {
                channel: None,
                src_id: None,
                base_id: "abc".into()
            }
        );
    }

    #[test]
    fn test_round_trip() {
        let channels = [None, Some("shell"), Some("control"), Some("stdin"), Some("iopub")];
        let src_ids = [None, Some("cell-1"), Some("a-b_c.d")];
        let bases = ["abc", "a1b2c3d4_12345_0", "5f1c-uuid-like-id"];

        for base in bases {
            for channel in channels {
                for src_id in src_ids {
                    let id = encode(base, channel, src_id).unwrap();
                    let parsed = decode(&id).unwrap();
                    assert_eq!(parsed.channel.as_deref(), channel, "id {}", id);
                    assert_eq!(parsed.src_id.as_deref(), src_id, "id {}", id);
                    assert_eq!(parsed.base_id, base, "id {}", id);
                }
            }
        }
    }

    #[test]
    fn test_reserved_characters_rejected() {
        assert_eq!(
            encode("b", Some("bad:channel"), None),
            Err(MsgIdError::InvalidChannel("bad:channel".into()))
        );
        assert_eq!(
            encode("b", None, Some("bad#id")),
            Err(MsgIdError::InvalidSrcId("bad#id".into()))
        );
        assert_eq!(
            encode("b", None, Some("bad:id")),
            Err(MsgIdError::InvalidSrcId("bad:id".into()))
        );
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(decode(""), Err(MsgIdError::InvalidFormat(_))));
    }

    #[test]
    fn test_decode_splits_last_hash_then_first_colon() {
        let parsed = decode("shell:base:with:colons#cell").unwrap();
        assert_eq!(parsed.channel.as_deref(), Some("shell"));
        assert_eq!(parsed.base_id, "base:with:colons");
        assert_eq!(parsed.src_id.as_deref(), Some("cell"));

        let parsed = decode("shell:a#b#cell").unwrap();
        assert_eq!(parsed.base_id, "a#b");
        assert_eq!(parsed.src_id.as_deref(), Some("cell"));
    }

    #[test]
    fn test_extractors() {
        let id = "shell:abc123_456_0#cell-xyz";
        assert_eq!(extract_channel(id).unwrap().as_deref(), Some("shell"));
        assert_eq!(extract_src_id(id).unwrap().as_deref(), Some("cell-xyz"));
        assert_eq!(extract_base_id(id).unwrap(), "abc123_456_0");
        assert_eq!(extract_channel("abc").unwrap(), None);
    }

    #[test]
    fn test_encode_channel_in_header_is_idempotent() {
        let parts = encode_channel_in_header(parts_with_ids("abc", None), "shell");
        assert_eq!(header_id(&parts[0]), "shell:abc");

        let parts = encode_channel_in_header(parts, "shell");
        assert_eq!(header_id(&parts[0]), "shell:abc");
    }

    #[test]
    fn test_encode_src_id_in_header() {
        let parts = encode_src_id_in_header(parts_with_ids("abc", None), "cell-1").unwrap();
        assert_eq!(header_id(&parts[0]), "abc#cell-1");

        let parts = encode_src_id_in_header(parts, "cell-2").unwrap();
        assert_eq!(header_id(&parts[0]), "abc#cell-1");

        assert!(encode_src_id_in_header(parts_with_ids("abc", None), "x#y").is_err());
    }

    #[test]
    fn test_strip_encoding() {
        let parts = parts_with_ids("iopub:k1_2_3", Some("shell:abc#cell-1"));
        let parts = strip_encoding(parts);
        assert_eq!(header_id(&parts[0]), "k1_2_3");
        assert_eq!(header_id(&parts[1]), "abc");
    }

    #[test]
    fn test_strip_encoding_leaves_plain_ids_untouched() {
        let original = parts_with_ids("plain", None);
        let stripped = strip_encoding(original.clone());
        assert_eq!(stripped, original);
    }

    #[test]
    fn test_strip_encoding_tolerates_garbage() {
        let parts = vec![Bytes::from_static(b"not json"), Bytes::from_static(b"{}")];
        assert_eq!(strip_encoding(parts.clone()), parts);
    }
}
