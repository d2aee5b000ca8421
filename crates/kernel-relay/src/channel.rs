use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The named kernel channels multiplexed over one kernel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Control,
    Stdin,
    #[serde(rename = "iopub")]
    IOPub,
    Heartbeat,
}

impl Channel {
    /// Channels that carry messages and get a receive loop.
    pub const MESSAGE_CHANNELS: [Channel; 4] = [
        Channel::IOPub,
        Channel::Shell,
        Channel::Stdin,
        Channel::Control,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Control => "control",
            Channel::Stdin => "stdin",
            Channel::IOPub => "iopub",
            Channel::Heartbeat => "heartbeat",
        }
    }

    /// Whether frontends may send messages on this channel.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, Channel::Shell | Channel::Control | Channel::Stdin)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown channel: {0}")]
pub struct UnknownChannel(pub String);

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(Channel::Shell),
            "control" => Ok(Channel::Control),
            "stdin" => Ok(Channel::Stdin),
            "iopub" => Ok(Channel::IOPub),
            "heartbeat" | "hb" => Ok(Channel::Heartbeat),
            other => Err(UnknownChannel(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        for channel in [
            Channel::Shell,
            Channel::Control,
            Channel::Stdin,
            Channel::IOPub,
            Channel::Heartbeat,
        ] {
            assert_eq!(channel.to_string().parse::<Channel>(), Ok(channel));
        }
        assert_eq!("hb".parse::<Channel>(), Ok(Channel::Heartbeat));
        assert!("bogus".parse::<Channel>().is_err());
    }

    #[test]
    fn test_channel_serde() {
        assert_eq!(serde_json::to_string(&Channel::IOPub).unwrap(), "\"iopub\"");
        let c: Channel = serde_json::from_str("\"control\"").unwrap();
        assert_eq!(c, Channel::Control);
    }

    #[test]
    fn test_accepts_requests() {
        assert!(Channel::Shell.accepts_requests());
        assert!(!Channel::IOPub.accepts_requests());
        assert!(!Channel::Heartbeat.accepts_requests());
    }
}
