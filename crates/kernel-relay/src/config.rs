//! Relay configuration, read from a TOML file.
//!
//! Every field has a default, so an empty file (or no file) is valid.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kernel_wire::WireProtocol;
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::listener::{ConflictingFilters, MessageFilter, MsgTypeChannel};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("[websocket] {0}")]
    ConflictingFilters(#[from] ConflictingFilters),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Binary framing used when the browser does not ask for v1.
    pub default_protocol: WireProtocol,
    pub client: ClientSettings,
    pub websocket: WebSocketSettings,
    pub kernels: Vec<KernelEntry>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8888)),
            default_protocol: WireProtocol::default(),
            client: ClientSettings::default(),
            websocket: WebSocketSettings::default(),
            kernels: Vec::new(),
        }
    }
}

/// `[client]`: timings of the shared kernel client, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    pub connect_timeout_secs: f64,
    pub connection_test_timeout_secs: f64,
    pub connection_test_check_interval_secs: f64,
    pub connection_test_retry_interval_secs: f64,
    pub connection_test_grace_secs: f64,
    pub heartbeat_check_interval_secs: f64,
    pub heartbeat_max_attempts: u32,
    pub recv_poll_interval_secs: f64,
    pub max_queue_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 150.0,
            connection_test_timeout_secs: 120.0,
            connection_test_check_interval_secs: 0.1,
            connection_test_retry_interval_secs: 10.0,
            connection_test_grace_secs: 0.5,
            heartbeat_check_interval_secs: 0.1,
            heartbeat_max_attempts: 10,
            recv_poll_interval_secs: 0.01,
            max_queue_size: 1000,
        }
    }
}

fn secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

impl ClientSettings {
    pub fn to_client_config(&self) -> Result<ClientConfig, ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "client.max_queue_size",
                value: "0".to_string(),
            });
        }
        Ok(ClientConfig {
            connect_timeout: secs("client.connect_timeout_secs", self.connect_timeout_secs)?,
            connection_test_timeout: secs(
                "client.connection_test_timeout_secs",
                self.connection_test_timeout_secs,
            )?,
            connection_test_check_interval: secs(
                "client.connection_test_check_interval_secs",
                self.connection_test_check_interval_secs,
            )?,
            connection_test_retry_interval: secs(
                "client.connection_test_retry_interval_secs",
                self.connection_test_retry_interval_secs,
            )?,
            connection_test_grace: secs(
                "client.connection_test_grace_secs",
                self.connection_test_grace_secs,
            )?,
            heartbeat_check_interval: secs(
                "client.heartbeat_check_interval_secs",
                self.heartbeat_check_interval_secs,
            )?,
            heartbeat_max_attempts: self.heartbeat_max_attempts,
            recv_poll_interval: secs("client.recv_poll_interval_secs", self.recv_poll_interval_secs)?,
            max_queue_size: self.max_queue_size,
        })
    }
}

/// `[websocket]`: which messages each browser socket receives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketSettings {
    pub msg_types: Option<Vec<MsgTypeChannel>>,
    pub exclude_msg_types: Option<Vec<MsgTypeChannel>>,
}

impl WebSocketSettings {
    pub fn filter(&self) -> Result<MessageFilter, ConflictingFilters> {
        MessageFilter::from_lists(self.msg_types.clone(), self.exclude_msg_types.clone())
    }
}

/// `[[kernels]]`: a kernel to attach to at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelEntry {
    pub id: String,
    /// Absolute, or relative to the Jupyter runtime directory.
    pub connection_file: PathBuf,
}

impl KernelEntry {
    pub fn resolved_connection_file(&self) -> PathBuf {
        resolve_connection_file(&self.connection_file)
    }
}

/// Resolve a connection file path against the Jupyter runtime directory.
pub fn resolve_connection_file(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        runtimelib::dirs::runtime_dir().join(path)
    }
}

/// `~/.config/kernel-relay/config.toml` (platform equivalent).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kernel-relay")
        .join("config.toml")
}

impl RelayConfig {
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    /// Load `path` if given, else the default config file if it exists,
    /// else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.websocket.filter()?;
        self.client.to_client_config()?;
        for kernel in &self.kernels {
            if kernel.id.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "kernels.id",
                    value: String::new(),
                });
            }
        }
        Ok(())
    }
}
