//! In-process transport.
//!
//! [`MemoryConnector`] hands the client sockets whose other end is a
//! [`MemoryKernel`]. The kernel side sees every request sent on shell,
//! control and stdin, and can publish messages on any channel. Connections
//! can be reopened; the kernel handle always talks to the latest one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use jupyter_protocol::ConnectionInfo;
use kernel_wire::{peek_header, MessageParts};
use log::{debug, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ChannelSocket, Frames, Heartbeat, Inbox, KernelChannels, KernelConnector};
use crate::channel::Channel;
use crate::session::Session;

struct Shared {
    requests_tx: mpsc::UnboundedSender<(Channel, Frames)>,
    requests_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Channel, Frames)>>,
    inboxes: Mutex<HashMap<Channel, Arc<Inbox>>>,
    session: Mutex<Session>,
    history: Mutex<Vec<(Channel, MessageParts)>>,
    beating: Arc<AtomicBool>,
    refuse: AtomicBool,
    opens: AtomicUsize,
}

/// Connector whose kernels live in the same process.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

/// The kernel end of a [`MemoryConnector`].
#[derive(Clone)]
pub struct MemoryKernel {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryKernel) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            requests_tx,
            requests_rx: tokio::sync::Mutex::new(requests_rx),
            inboxes: Mutex::new(HashMap::new()),
            session: Mutex::new(Session::unsigned("memory-kernel")),
            history: Mutex::new(Vec::new()),
            beating: Arc::new(AtomicBool::new(true)),
            refuse: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
        });
        (
            Self {
                shared: shared.clone(),
            },
            MemoryKernel { shared },
        )
    }
}

#[async_trait]
impl KernelConnector for MemoryConnector {
    async fn open(&self, info: &ConnectionInfo, _session_id: &str) -> Result<KernelChannels> {
        if self.shared.refuse.load(Ordering::Acquire) {
            anyhow::bail!("connection refused");
        }

        // The kernel signs with the key from the connection info, like a real one.
        let session = Session::new("memory-kernel", info)?;
        if let Ok(mut current) = self.shared.session.lock() {
            *current = session;
        }

        let mut inboxes = HashMap::new();
        let mut socket = |channel: Channel| -> Arc<dyn ChannelSocket> {
            let inbox = Arc::new(Inbox::default());
            inboxes.insert(channel, inbox.clone());
            Arc::new(MemorySocket {
                channel,
                inbox,
                requests: self.shared.requests_tx.clone(),
            })
        };
        let channels = KernelChannels {
            shell: socket(Channel::Shell),
            iopub: socket(Channel::IOPub),
            stdin: socket(Channel::Stdin),
            control: socket(Channel::Control),
            heartbeat: Arc::new(MemoryHeartbeat {
                beating: self.shared.beating.clone(),
                closed: AtomicBool::new(false),
            }),
        };

        if let Ok(mut current) = self.shared.inboxes.lock() {
            for inbox in current.values() {
                inbox.close();
            }
            *current = inboxes;
        }
        self.shared.opens.fetch_add(1, Ordering::AcqRel);
        Ok(channels)
    }
}

struct MemorySocket {
    channel: Channel,
    inbox: Arc<Inbox>,
    requests: mpsc::UnboundedSender<(Channel, Frames)>,
}

#[async_trait]
impl ChannelSocket for MemorySocket {
    async fn send(&self, frames: Frames) -> Result<()> {
        if self.channel == Channel::IOPub {
            anyhow::bail!("iopub socket is receive-only");
        }
        if self.inbox.is_closed() {
            anyhow::bail!("{} socket is closed", self.channel);
        }
        self.requests
            .send((self.channel, frames))
            .map_err(|_| anyhow::anyhow!("kernel has gone away"))
    }

    fn is_alive(&self) -> bool {
        !self.inbox.is_closed()
    }

    fn msg_ready(&self) -> bool {
        !self.inbox.is_empty()
    }

    async fn recv_multipart(&self) -> Result<Frames> {
        self.inbox.recv().await
    }

    fn close(&self) {
        self.inbox.close();
    }
}

struct MemoryHeartbeat {
    beating: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Heartbeat for MemoryHeartbeat {
    fn is_beating(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.beating.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl MemoryKernel {
    /// Make the heartbeat stop (or resume) answering.
    pub fn set_beating(&self, beating: bool) {
        self.shared.beating.store(beating, Ordering::Release);
    }

    /// Make future connection attempts fail.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::Release);
    }

    /// How many times a connection has been opened.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::Acquire)
    }

    fn session(&self) -> Session {
        self.shared
            .session
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| Session::unsigned("memory-kernel"))
    }

    /// Wait for the next request from the client, verified and stripped of
    /// its identities and signature. `None` once every sender is gone.
    pub async fn recv_request(&self) -> Option<(Channel, MessageParts)> {
        let mut requests = self.shared.requests_rx.lock().await;
        loop {
            let (channel, frames) = requests.recv().await?;
            match self.session().deserialize(frames) {
                Ok(parts) => return Some(self.record(channel, parts)),
                Err(e) => warn!("[memory-kernel] Dropping {} request: {}", channel, e),
            }
        }
    }

    fn record(&self, channel: Channel, parts: MessageParts) -> (Channel, MessageParts) {
        if let Ok(mut history) = self.shared.history.lock() {
            history.push((channel, parts.clone()));
        }
        (channel, parts)
    }

    /// Every request received so far, in arrival order.
    pub fn received_requests(&self) -> Vec<(Channel, MessageParts)> {
        self.shared
            .history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    /// Take a request if one is waiting.
    pub fn try_recv_request(&self) -> Option<(Channel, MessageParts)> {
        let mut requests = self.shared.requests_rx.try_lock().ok()?;
        while let Ok((channel, frames)) = requests.try_recv() {
            if let Ok(parts) = self.session().deserialize(frames) {
                return Some(self.record(channel, parts));
            }
        }
        None
    }

    /// Deliver already-framed wire frames to the client on `channel`.
    pub fn send_frames(&self, channel: Channel, frames: Frames) -> Result<()> {
        let inbox = self
            .shared
            .inboxes
            .lock()
            .ok()
            .and_then(|inboxes| inboxes.get(&channel).cloned())
            .ok_or_else(|| anyhow::anyhow!("no open {} socket", channel))?;
        if inbox.is_closed() {
            anyhow::bail!("{} socket is closed", channel);
        }
        inbox.push(frames);
        Ok(())
    }

    /// Sign and deliver message parts to the client on `channel`.
    pub fn send(&self, channel: Channel, parts: &[Bytes]) -> Result<()> {
        let frames = self.session().serialize(parts);
        self.send_frames(channel, frames)
    }

    /// Publish a `status` message on iopub in reply to `parent`.
    pub fn publish_status(&self, parent: &Bytes, execution_state: &str) -> Result<()> {
        let parts = self.session().message(
            "status",
            Some(parent),
            json!({ "execution_state": execution_state }),
        );
        self.send(Channel::IOPub, &parts)
    }

    /// Answer a request the way a well-behaved kernel does: busy, reply, idle.
    pub fn reply(&self, channel: Channel, request: &MessageParts) -> Result<()> {
        let parent = request
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("request has no header"))?;
        let msg_type = peek_header(&parent)?.msg_type;
        let reply_type = msg_type
            .strip_suffix("_request")
            .map(|t| format!("{}_reply", t))
            .unwrap_or_else(|| format!("{}_reply", msg_type));

        self.publish_status(&parent, "busy")?;
        let content: Value = json!({ "status": "ok" });
        let reply = self.session().message(&reply_type, Some(&parent), content);
        self.send(channel, &reply)?;
        self.publish_status(&parent, "idle")
    }

    /// Spawn a task that answers every request with [`reply`](Self::reply).
    pub fn spawn_responder(&self) -> JoinHandle<()> {
        let kernel = self.clone();
        tokio::spawn(async move {
            while let Some((channel, request)) = kernel.recv_request().await {
                if let Err(e) = kernel.reply(channel, &request) {
                    debug!("[memory-kernel] Could not reply on {}: {}", channel, e);
                }
            }
        })
    }
}
