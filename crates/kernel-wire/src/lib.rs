//! Jupyter message parts and browser-facing WebSocket framings.
//!
//! A kernel message travels through the relay as its raw parts:
//!
//! ```text
//! [header, parent_header, metadata, content, buffers...]
//! ```
//!
//! each part being the JSON (or raw buffer) bytes exactly as the kernel or
//! browser produced them. This crate converts between that representation
//! and the frames written to browser WebSockets.
//!
//! # Framings
//!
//! - [`layout`]: a little-endian `u16` length, a JSON layout header
//!   (`{"channel", "offsets"}`), then the concatenated parts
//! - [`v1`]: the `v1.kernel.websocket.jupyter.org` offset-table protocol
//! - [`message`]: legacy JSON text frames with base64-encoded buffers
//!
//! [`WireProtocol`] selects between the two binary framings at runtime.

mod base64;
pub mod header;
pub mod layout;
pub mod message;
mod protocol;
pub mod v1;

pub use base64::{deserialize_buffers, serialize_buffers};
pub use header::{peek_header, rewrite_msg_id, HeaderRef};
pub use message::JsonWireMessage;
pub use protocol::{WireProtocol, V1_SUBPROTOCOL};

/// The raw parts of one kernel message, without identities or signature.
pub type MessageParts = Vec<bytes::Bytes>;

/// Number of parts every kernel message carries before its buffers.
pub const MIN_MESSAGE_PARTS: usize = 4;

/// Error type for frame and part conversion failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("layout header too large: {0} bytes")]
    LayoutTooLarge(usize),

    #[error("invalid offsets: {0}")]
    InvalidOffsets(String),

    #[error("channel name is not valid UTF-8")]
    InvalidChannel,

    #[error("message has {0} parts, expected at least 4")]
    TooFewParts(usize),

    #[error("header is missing field `{0}`")]
    MissingField(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
