//! kernel-relay: many browser WebSockets, one kernel connection.
//!
//! Each attached kernel gets a single [`SharedKernelClient`] which owns the
//! kernel sockets. Browser connections are [`KernelWebsocketConnection`]s
//! registered on that client as listeners. Routing metadata travels inside
//! message ids (see [`msg_id`]), so replies find their way back without any
//! per-request bookkeeping.

pub mod bridge;
pub mod channel;
pub mod client;
pub mod config;
pub mod execution_state;
pub mod kernel_manager;
pub mod listener;
pub mod msg_id;
pub mod queue;
pub mod server;
pub mod session;
pub mod transport;

pub use bridge::{
    BridgeConfig, BridgeError, IncomingFrame, KernelWebsocketConnection, SinkError, WebSocketSink,
};
pub use channel::Channel;
pub use client::{ClientConfig, ClientError, ConnectionPhase, SharedKernelClient};
pub use config::{ConfigError, RelayConfig};
pub use execution_state::{ExecutionState, StateTracker};
pub use kernel_manager::{KernelRegistry, KernelSummary, ManagerError};
pub use listener::{KernelListener, ListenerId, MessageFilter};
pub use transport::{KernelConnector, MemoryConnector, MemoryKernel, ZmqConnector};
