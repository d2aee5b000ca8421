//! The `v1.kernel.websocket.jupyter.org` binary framing.
//!
//! ```text
//! [8 bytes: offset count n (LE u64)] [n * 8 bytes: offsets (LE u64)] [channel] [parts...]
//! ```
//!
//! Offsets are absolute positions in the frame. The first points at the
//! channel name, each following one at the start of the next part, and the
//! last at the end of the frame.

use bytes::Bytes;

use crate::{MessageParts, WireError};

const WORD: usize = 8;

/// Encode a channel and its message parts into one v1 frame.
pub fn encode(channel: &str, parts: &[Bytes]) -> Vec<u8> {
    let channel = channel.as_bytes();
    let count = 1 + 1 + parts.len();
    let mut offsets = Vec::with_capacity(count);
    offsets.push(WORD * (1 + count));
    offsets.push(offsets[0] + channel.len());
    for part in parts {
        let last = offsets[offsets.len() - 1];
        offsets.push(last + part.len());
    }

    let total = offsets[offsets.len() - 1];
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(count as u64).to_le_bytes());
    for offset in &offsets {
        frame.extend_from_slice(&(*offset as u64).to_le_bytes());
    }
    frame.extend_from_slice(channel);
    for part in parts {
        frame.extend_from_slice(part);
    }
    frame
}

fn read_word(frame: &[u8], index: usize) -> Result<usize, WireError> {
    let start = index * WORD;
    let end = start + WORD;
    let bytes = frame.get(start..end).ok_or(WireError::Truncated {
        needed: end,
        available: frame.len(),
    })?;
    let mut word = [0u8; WORD];
    word.copy_from_slice(bytes);
    usize::try_from(u64::from_le_bytes(word))
        .map_err(|_| WireError::InvalidOffsets("offset does not fit in memory".into()))
}

/// Decode a v1 frame into its channel name and message parts.
pub fn decode(frame: Bytes) -> Result<(String, MessageParts), WireError> {
    let count = read_word(&frame, 0)?;
    if count < 2 {
        return Err(WireError::InvalidOffsets(format!(
            "offset count {} is below 2",
            count
        )));
    }
    let table_end = count
        .checked_add(1)
        .and_then(|n| n.checked_mul(WORD))
        .ok_or_else(|| WireError::InvalidOffsets("offset count overflows".into()))?;
    if frame.len() < table_end {
        return Err(WireError::Truncated {
            needed: table_end,
            available: frame.len(),
        });
    }

    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        offsets.push(read_word(&frame, i + 1)?);
    }

    for window in offsets.windows(2) {
        if window[1] < window[0] {
            return Err(WireError::InvalidOffsets(format!(
                "offsets decrease from {} to {}",
                window[0], window[1]
            )));
        }
    }
    if offsets[0] < table_end || offsets[count - 1] > frame.len() {
        return Err(WireError::InvalidOffsets(format!(
            "offsets {}..{} outside frame of {} bytes",
            offsets[0],
            offsets[count - 1],
            frame.len()
        )));
    }

    let channel = std::str::from_utf8(&frame[offsets[0]..offsets[1]])
        .map_err(|_| WireError::InvalidChannel)?
        .to_string();
    let parts = offsets[1..]
        .windows(2)
        .map(|w| frame.slice(w[0]..w[1]))
        .collect();

    Ok((channel, parts))
}
