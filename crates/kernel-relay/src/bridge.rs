//! Per-WebSocket bridge between a browser and a shared kernel client.
//!
//! Inbound frames are decoded, get the frontend's `metadata.cellId`
//! encoded into their msg_id and are handed to the kernel's
//! [`SharedKernelClient`]. Kernel messages come back through the
//! [`KernelListener`] impl, have all msg_id encoding stripped and are
//! written to the socket in the negotiated framing.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use kernel_wire::{header::parse_part, JsonWireMessage, MessageParts, WireError, WireProtocol, MIN_MESSAGE_PARTS};
use log::{debug, error, info, warn};

use crate::channel::{Channel, UnknownChannel};
use crate::client::{ClientError, SharedKernelClient};
use crate::kernel_manager::KernelRegistry;
use crate::listener::{KernelListener, ListenerId, MessageFilter};
use crate::msg_id::{self, MsgIdError};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("websocket is closed")]
    Closed,

    #[error("websocket send buffer is full")]
    Full,

    #[error("websocket write failed: {0}")]
    Io(String),
}

/// The writing half of a browser WebSocket.
#[async_trait]
pub trait WebSocketSink: Send + Sync {
    async fn write_message(&self, data: Vec<u8>, binary: bool) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no kernel client for kernel {0}")]
    NoKernelClient(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Channel(#[from] UnknownChannel),

    #[error(transparent)]
    MsgId(#[from] MsgIdError),
}

/// A frame read from a browser WebSocket.
#[derive(Debug, Clone)]
pub enum IncomingFrame {
    Binary(Bytes),
    /// Legacy JSON message with base64 buffers.
    Text(String),
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Framing for binary frames in both directions.
    pub protocol: WireProtocol,
    pub filter: MessageFilter,
}

pub struct KernelWebsocketConnection {
    kernel_id: String,
    registry: Arc<KernelRegistry>,
    sink: Arc<dyn WebSocketSink>,
    config: BridgeConfig,
    attached: Mutex<Option<(Arc<SharedKernelClient>, ListenerId)>>,
}

impl KernelWebsocketConnection {
    pub fn new(
        kernel_id: impl Into<String>,
        registry: Arc<KernelRegistry>,
        sink: Arc<dyn WebSocketSink>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            kernel_id: kernel_id.into(),
            registry,
            sink,
            config,
            attached: Mutex::new(None),
        })
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn protocol(&self) -> WireProtocol {
        self.config.protocol
    }

    fn client(&self) -> Option<Arc<SharedKernelClient>> {
        self.attached
            .lock()
            .ok()
            .and_then(|attached| attached.as_ref().map(|(client, _)| client.clone()))
    }

    /// Register with the kernel's shared client and send the current
    /// execution state to this socket.
    ///
    /// Connecting again re-sends the state; a registration on a client the
    /// registry no longer holds is replaced.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BridgeError> {
        let client = self
            .registry
            .get(&self.kernel_id)
            .ok_or_else(|| BridgeError::NoKernelClient(self.kernel_id.clone()))?;

        let stale = {
            let mut attached = self
                .attached
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match attached.take() {
                Some((current, id)) if Arc::ptr_eq(&current, &client) => {
                    *attached = Some((current, id));
                    None
                }
                previous => {
                    let id =
                        client.add_listener_with_filter(self.clone(), self.config.filter.clone());
                    *attached = Some((client.clone(), id));
                    previous
                }
            }
        };
        if let Some((previous, id)) = stale {
            previous.remove_listener(id);
        }

        client.broadcast_state().await;
        info!(
            "[ws-bridge] Kernel websocket connected and listening for kernel {}",
            self.kernel_id
        );
        Ok(())
    }

    /// Deregister from the shared client. Never fails.
    pub fn disconnect(&self) {
        let attached = match self.attached.lock() {
            Ok(mut attached) => attached.take(),
            Err(e) => {
                warn!(
                    "[ws-bridge] Failed to disconnect websocket for kernel {}: {}",
                    self.kernel_id, e
                );
                return;
            }
        };
        if let Some((client, id)) = attached {
            client.remove_listener(id);
            debug!("[ws-bridge] Websocket for kernel {} disconnected", self.kernel_id);
        }
    }

    /// Forward a frame from the browser to the kernel. Malformed frames are
    /// logged and dropped.
    pub async fn handle_incoming_message(&self, frame: IncomingFrame) {
        if let Err(e) = self.forward(frame).await {
            error!(
                "[ws-bridge] Failed to handle incoming message for kernel {}: {}",
                self.kernel_id, e
            );
        }
    }

    async fn forward(&self, frame: IncomingFrame) -> Result<(), BridgeError> {
        let (channel, parts) = match frame {
            IncomingFrame::Binary(data) => self.config.protocol.decode(data)?,
            IncomingFrame::Text(text) => JsonWireMessage::from_text(&text)?.into_parts()?,
        };
        let channel: Channel = channel.parse()?;
        let client = self
            .client()
            .ok_or_else(|| BridgeError::NoKernelClient(self.kernel_id.clone()))?;

        let parts = encode_cell_id(parts);
        client.handle_incoming_message(channel, parts).await?;
        Ok(())
    }

    async fn send_to_socket(&self, channel: Channel, parts: MessageParts) -> anyhow::Result<()> {
        if parts.len() < MIN_MESSAGE_PARTS {
            warn!(
                "[ws-bridge] Message on {} has insufficient parts: {}",
                channel,
                parts.len()
            );
            return Ok(());
        }
        for (i, part) in parts.iter().take(MIN_MESSAGE_PARTS).enumerate() {
            if let Err(e) = serde_json::from_slice::<serde::de::IgnoredAny>(part) {
                anyhow::bail!("message part {} on {} is not JSON: {}", i, channel, e);
            }
        }

        let parts = msg_id::strip_encoding(parts);
        let data = self.config.protocol.encode(channel.as_str(), &parts)?;
        match self.sink.write_message(data, true).await {
            Ok(()) => Ok(()),
            Err(SinkError::Closed) => {
                warn!("[ws-bridge] A kernel message arrived on a closed websocket channel");
                Ok(())
            }
            Err(SinkError::Full) => {
                warn!(
                    "[ws-bridge] Websocket for kernel {} is not keeping up, dropping {} message",
                    self.kernel_id, channel
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Append the frontend's `metadata.cellId` to the header msg_id.
fn encode_cell_id(parts: MessageParts) -> MessageParts {
    let cell_id = parts
        .get(2)
        .and_then(|metadata| parse_part(metadata).ok())
        .and_then(|metadata| {
            metadata
                .get("cellId")
                .and_then(|c| c.as_str())
                .map(str::to_string)
        });
    let Some(cell_id) = cell_id.filter(|c| !c.is_empty()) else {
        return parts;
    };

    match msg_id::encode_src_id_in_header(parts.clone(), &cell_id) {
        Ok(parts) => parts,
        Err(e) => {
            debug!("[ws-bridge] Error encoding cellId in msg_id: {}", e);
            parts
        }
    }
}

#[async_trait]
impl KernelListener for KernelWebsocketConnection {
    async fn handle_outgoing_message(
        &self,
        channel: Channel,
        parts: MessageParts,
    ) -> anyhow::Result<()> {
        self.send_to_socket(channel, parts).await
    }
}

impl Drop for KernelWebsocketConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
