use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{layout, v1, MessageParts, WireError};

/// WebSocket subprotocol name for the v1 offset-table framing.
pub const V1_SUBPROTOCOL: &str = "v1.kernel.websocket.jupyter.org";

/// Binary framing used on a browser WebSocket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireProtocol {
    /// Length-prefixed JSON layout header followed by the parts.
    #[default]
    JsonLayout,
    /// `v1.kernel.websocket.jupyter.org`.
    V1,
}

impl WireProtocol {
    /// Pick a framing from the subprotocols offered by a client.
    pub fn negotiate<'a, I>(offered: I, fallback: WireProtocol) -> WireProtocol
    where
        I: IntoIterator<Item = &'a str>,
    {
        if offered.into_iter().any(|p| p.trim() == V1_SUBPROTOCOL) {
            WireProtocol::V1
        } else {
            fallback
        }
    }

    /// Subprotocol to echo back in the upgrade response, if any.
    pub fn subprotocol(self) -> Option<&'static str> {
        match self {
            WireProtocol::JsonLayout => None,
            WireProtocol::V1 => Some(V1_SUBPROTOCOL),
        }
    }

    pub fn encode(self, channel: &str, parts: &[Bytes]) -> Result<Vec<u8>, WireError> {
        match self {
            WireProtocol::JsonLayout => layout::encode(channel, parts),
            WireProtocol::V1 => Ok(v1::encode(channel, parts)),
        }
    }

    pub fn decode(self, frame: Bytes) -> Result<(String, MessageParts), WireError> {
        match self {
            WireProtocol::JsonLayout => layout::decode(frame),
            WireProtocol::V1 => v1::decode(frame),
        }
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireProtocol::JsonLayout => write!(f, "json-layout"),
            WireProtocol::V1 => write!(f, "v1"),
        }
    }
}

impl FromStr for WireProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json-layout" => Ok(WireProtocol::JsonLayout),
            "v1" | V1_SUBPROTOCOL => Ok(WireProtocol::V1),
            other => Err(format!("unknown wire protocol: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        let offered = ["chat", V1_SUBPROTOCOL];
        assert_eq!(
            WireProtocol::negotiate(offered, WireProtocol::JsonLayout),
            WireProtocol::V1
        );
        assert_eq!(
            WireProtocol::negotiate(["chat"], WireProtocol::JsonLayout),
            WireProtocol::JsonLayout
        );
    }

    #[test]
    fn test_parse_and_display() {
        for protocol in [WireProtocol::JsonLayout, WireProtocol::V1] {
            assert_eq!(protocol.to_string().parse::<WireProtocol>(), Ok(protocol));
        }
        assert!("v2".parse::<WireProtocol>().is_err());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&WireProtocol::JsonLayout).unwrap(),
            "\"json-layout\""
        );
        let v1: WireProtocol = serde_json::from_str("\"v1\"").unwrap();
        assert_eq!(v1, WireProtocol::V1);
    }

    #[test]
    fn test_frames_are_not_interchangeable() {
        let parts = vec![Bytes::from_static(b"{}")];
        let frame = WireProtocol::V1.encode("shell", &parts).unwrap();
        assert!(WireProtocol::JsonLayout.decode(Bytes::from(frame)).is_err());
    }
}
