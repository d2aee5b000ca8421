//! Kernel channel transports.
//!
//! The client speaks to a kernel through one [`ChannelSocket`] per message
//! channel plus a [`Heartbeat`]. Sockets carry raw wire frames (identities,
//! delimiter, signature and parts); signing is the client's job.

mod memory;
mod zmq;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use jupyter_protocol::ConnectionInfo;
use tokio::sync::Notify;

use crate::channel::Channel;

pub use memory::{MemoryConnector, MemoryKernel};
pub use zmq::ZmqConnector;

/// Raw multipart frames as they appear on a kernel socket.
pub type Frames = Vec<Bytes>;

/// One kernel message channel.
#[async_trait]
pub trait ChannelSocket: Send + Sync {
    /// Send one multipart message.
    async fn send(&self, frames: Frames) -> Result<()>;

    /// Whether the underlying socket is still usable.
    fn is_alive(&self) -> bool;

    /// Whether a message can be received without waiting.
    fn msg_ready(&self) -> bool;

    /// Receive the next multipart message.
    async fn recv_multipart(&self) -> Result<Frames>;

    fn close(&self);
}

/// Kernel heartbeat monitor.
pub trait Heartbeat: Send + Sync {
    fn is_beating(&self) -> bool;

    fn close(&self);
}

/// The sockets of one open kernel connection.
pub struct KernelChannels {
    pub shell: Arc<dyn ChannelSocket>,
    pub iopub: Arc<dyn ChannelSocket>,
    pub stdin: Arc<dyn ChannelSocket>,
    pub control: Arc<dyn ChannelSocket>,
    pub heartbeat: Arc<dyn Heartbeat>,
}

impl KernelChannels {
    /// The socket for a message channel; `None` for the heartbeat.
    pub fn socket(&self, channel: Channel) -> Option<&Arc<dyn ChannelSocket>> {
        match channel {
            Channel::Shell => Some(&self.shell),
            Channel::IOPub => Some(&self.iopub),
            Channel::Stdin => Some(&self.stdin),
            Channel::Control => Some(&self.control),
            Channel::Heartbeat => None,
        }
    }

    pub fn close(&self) {
        for channel in Channel::MESSAGE_CHANNELS {
            if let Some(socket) = self.socket(channel) {
                socket.close();
            }
        }
        self.heartbeat.close();
    }
}

/// Opens kernel connections.
#[async_trait]
pub trait KernelConnector: Send + Sync {
    async fn open(&self, info: &ConnectionInfo, session_id: &str) -> Result<KernelChannels>;
}

/// Received messages waiting to be picked up by a receive loop.
#[derive(Default)]
pub(crate) struct Inbox {
    queue: Mutex<VecDeque<Frames>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Inbox {
    pub(crate) fn push(&self, frames: Frames) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(frames);
        }
        self.notify.notify_one();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    fn pop(&self) -> Option<Frames> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Wait for the next message. Fails once the inbox is closed and drained.
    pub(crate) async fn recv(&self) -> Result<Frames> {
        loop {
            if let Some(frames) = self.pop() {
                return Ok(frames);
            }
            if self.is_closed() {
                anyhow::bail!("socket closed");
            }
            self.notify.notified().await;
        }
    }
}
