//! Layout-header framing for binary WebSocket frames.
//!
//! ```text
//! [2 bytes: layout length (little-endian u16)] [layout JSON] [part bytes...]
//! ```
//!
//! The layout is `{"channel": "shell", "offsets": [0, n1, n2, ...]}`. Offsets
//! are cumulative part boundaries relative to the first part byte: the list
//! starts with 0 and ends with the total payload length, so it always holds
//! one entry more than there are parts.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{MessageParts, WireError};

const LENGTH_PREFIX: usize = 2;

#[derive(Debug, Serialize, Deserialize)]
struct Layout {
    channel: String,
    offsets: Vec<usize>,
}

/// Encode a channel and its message parts into one binary frame.
pub fn encode(channel: &str, parts: &[Bytes]) -> Result<Vec<u8>, WireError> {
    let mut offsets = Vec::with_capacity(parts.len() + 1);
    offsets.push(0);
    for part in parts {
        let last = offsets[offsets.len() - 1];
        offsets.push(last + part.len());
    }
    let payload_len = offsets[offsets.len() - 1];

    let layout = serde_json::to_vec(&Layout {
        channel: channel.to_string(),
        offsets,
    })?;
    let layout_len =
        u16::try_from(layout.len()).map_err(|_| WireError::LayoutTooLarge(layout.len()))?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + layout.len() + payload_len);
    frame.extend_from_slice(&layout_len.to_le_bytes());
    frame.extend_from_slice(&layout);
    for part in parts {
        frame.extend_from_slice(part);
    }
    Ok(frame)
}

/// Decode a binary frame into its channel name and message parts.
///
/// Parts are zero-copy slices of `frame`.
pub fn decode(frame: Bytes) -> Result<(String, MessageParts), WireError> {
    if frame.len() < LENGTH_PREFIX {
        return Err(WireError::Truncated {
            needed: LENGTH_PREFIX,
            available: frame.len(),
        });
    }
    let layout_len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
    let payload_start = LENGTH_PREFIX + layout_len;
    if frame.len() < payload_start {
        return Err(WireError::Truncated {
            needed: payload_start,
            available: frame.len(),
        });
    }

    let layout: Layout = serde_json::from_slice(&frame[LENGTH_PREFIX..payload_start])?;
    let payload = frame.slice(payload_start..);

    match layout.offsets.first() {
        Some(0) => {}
        Some(first) => {
            return Err(WireError::InvalidOffsets(format!(
                "first offset is {}, expected 0",
                first
            )))
        }
        None => return Err(WireError::InvalidOffsets("empty offset list".into())),
    }

    let last = layout.offsets[layout.offsets.len() - 1];
    if last != payload.len() {
        return Err(WireError::InvalidOffsets(format!(
            "last offset {} does not match payload length {}",
            last,
            payload.len()
        )));
    }

    let mut parts = Vec::with_capacity(layout.offsets.len() - 1);
    for window in layout.offsets.windows(2) {
        let (start, end) = (window[0], window[1]);
        if end < start {
            return Err(WireError::InvalidOffsets(format!(
                "offsets decrease from {} to {}",
                start, end
            )));
        }
        if end > payload.len() {
            return Err(WireError::InvalidOffsets(format!(
                "offset {} past payload end {}",
                end,
                payload.len()
            )));
        }
        parts.push(payload.slice(start..end));
    }

    Ok((layout.channel, parts))
}
