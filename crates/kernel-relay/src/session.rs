//! Jupyter wire-level session: message signing, identity routing and
//! header construction.
//!
//! A message on a kernel socket looks like
//!
//! ```text
//! [identities…, b"<IDS|MSG>", signature, header, parent_header, metadata, content, buffers…]
//! ```
//!
//! where `signature` is the hex HMAC-SHA256 of the four JSON parts, or empty
//! when the connection has no key.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use jupyter_protocol::ConnectionInfo;
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use kernel_wire::MIN_MESSAGE_PARTS;

type HmacSha256 = Hmac<Sha256>;

/// Separates routing identities from the message proper.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

pub const PROTOCOL_VERSION: &str = "5.3";

const SIGNATURE_SCHEME: &str = "hmac-sha256";
const USERNAME: &str = "kernel-relay";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid signing key")]
    InvalidKey,

    #[error("message has no <IDS|MSG> delimiter")]
    MissingDelimiter,

    #[error("message has too few parts: {0}")]
    TooFewParts(usize),

    #[error("message signature does not match")]
    BadSignature,
}

/// Signs outgoing and verifies incoming messages for one kernel connection.
#[derive(Clone)]
pub struct Session {
    id: String,
    key: Option<HmacSha256>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("signed", &self.key.is_some())
            .finish()
    }
}

impl Session {
    /// Session keyed from a kernel's connection info.
    pub fn new(id: impl Into<String>, info: &ConnectionInfo) -> Result<Self, SessionError> {
        let key = if info.key.is_empty() {
            None
        } else {
            if info.signature_scheme != SIGNATURE_SCHEME {
                return Err(SessionError::UnsupportedScheme(
                    info.signature_scheme.clone(),
                ));
            }
            Some(
                HmacSha256::new_from_slice(info.key.as_bytes())
                    .map_err(|_| SessionError::InvalidKey)?,
            )
        };
        Ok(Self { id: id.into(), key })
    }

    /// Session that neither signs nor verifies.
    pub fn unsigned(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_signed(&self) -> bool {
        self.key.is_some()
    }

    /// Hex signature of the four JSON parts.
    pub fn sign(&self, parts: &[Bytes]) -> String {
        match &self.key {
            Some(key) => {
                let mut mac = key.clone();
                for part in parts.iter().take(MIN_MESSAGE_PARTS) {
                    mac.update(part);
                }
                hex::encode(mac.finalize().into_bytes())
            }
            None => String::new(),
        }
    }

    fn verify(&self, signature: &[u8], parts: &[Bytes]) -> Result<(), SessionError> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        let expected = hex::decode(signature).map_err(|_| SessionError::BadSignature)?;
        let mut mac = key.clone();
        for part in parts.iter().take(MIN_MESSAGE_PARTS) {
            mac.update(part);
        }
        mac.verify_slice(&expected)
            .map_err(|_| SessionError::BadSignature)
    }

    /// Frame message parts for the wire, without routing identities.
    pub fn serialize(&self, parts: &[Bytes]) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(parts.len() + 2);
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::from(self.sign(parts)));
        frames.extend(parts.iter().cloned());
        frames
    }

    /// Strip identities and the signature from wire frames, checking the
    /// signature when this session has a key.
    pub fn deserialize(&self, frames: Vec<Bytes>) -> Result<Vec<Bytes>, SessionError> {
        let (_identities, mut rest) = feed_identities(frames)?;
        if rest.len() < MIN_MESSAGE_PARTS + 1 {
            return Err(SessionError::TooFewParts(rest.len().saturating_sub(1)));
        }
        let parts = rest.split_off(1);
        self.verify(&rest[0], &parts)?;
        Ok(parts)
    }

    /// A fresh message header.
    pub fn new_header(&self, msg_type: &str) -> Value {
        json!({
            "msg_id": Uuid::new_v4().to_string(),
            "session": self.id,
            "username": USERNAME,
            "date": chrono::Utc::now().to_rfc3339(),
            "msg_type": msg_type,
            "version": PROTOCOL_VERSION,
        })
    }

    /// Build the four JSON parts of a new message.
    pub fn message(&self, msg_type: &str, parent_header: Option<&Bytes>, content: Value) -> Vec<Bytes> {
        let header = self.new_header(msg_type);
        vec![
            Bytes::from(header.to_string()),
            parent_header
                .cloned()
                .unwrap_or_else(|| Bytes::from_static(b"{}")),
            Bytes::from_static(b"{}"),
            Bytes::from(content.to_string()),
        ]
    }
}

/// Split wire frames at the `<IDS|MSG>` delimiter into routing identities
/// and everything after the delimiter.
pub fn feed_identities(mut frames: Vec<Bytes>) -> Result<(Vec<Bytes>, Vec<Bytes>), SessionError> {
    let idx = frames
        .iter()
        .position(|f| f.as_ref() == DELIMITER)
        .ok_or(SessionError::MissingDelimiter)?;
    let rest = frames.split_off(idx + 1);
    frames.truncate(idx);
    Ok((frames, rest))
}
