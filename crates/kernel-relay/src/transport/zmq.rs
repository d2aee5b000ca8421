//! ZeroMQ transport: DEALER sockets for shell, control and stdin, SUB for
//! iopub, and a REQ pinger for the heartbeat.
//!
//! Each socket is owned by a pump task which forwards received messages to
//! an [`Inbox`] and performs sends handed to it over a channel.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use jupyter_protocol::ConnectionInfo;
use log::{debug, error, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use zeromq::{
    util::PeerIdentity, DealerSocket, ReqSocket, Socket, SocketOptions, SocketRecv, SocketSend,
    SubSocket, ZmqMessage,
};

use super::{ChannelSocket, Frames, Heartbeat, Inbox, KernelChannels, KernelConnector};
use crate::channel::Channel;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);
const OUTBOUND_CAPACITY: usize = 64;

type Outbound = (Frames, oneshot::Sender<Result<()>>);

/// Connects to kernels over ZeroMQ using the ports of a connection file.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZmqConnector;

impl ZmqConnector {
    pub fn new() -> Self {
        Self
    }
}

fn endpoint(info: &ConnectionInfo, port: u16) -> String {
    let transport = serde_json::to_value(&info.transport)
        .ok()
        .and_then(|v| v.as_str().map(str::to_lowercase))
        .unwrap_or_else(|| "tcp".to_string());
    if transport == "ipc" {
        format!("ipc://{}-{}", info.ip, port)
    } else {
        format!("tcp://{}:{}", info.ip, port)
    }
}

fn dealer_options(session_id: &str) -> Result<SocketOptions> {
    let mut options = SocketOptions::default();
    let identity = PeerIdentity::from_str(session_id)
        .map_err(|e| anyhow::anyhow!("invalid peer identity {}: {}", session_id, e))?;
    options.peer_identity(identity);
    Ok(options)
}

fn to_zmq(frames: Frames) -> Result<ZmqMessage> {
    let mut frames = frames.into_iter();
    let first = frames
        .next()
        .context("cannot send an empty multipart message")?;
    let mut message = ZmqMessage::from(first);
    for frame in frames {
        message.push_back(frame);
    }
    Ok(message)
}

#[async_trait]
impl KernelConnector for ZmqConnector {
    async fn open(&self, info: &ConnectionInfo, session_id: &str) -> Result<KernelChannels> {
        let shell = ZmqChannel::dealer(Channel::Shell, &endpoint(info, info.shell_port), session_id)
            .await?;
        let control =
            ZmqChannel::dealer(Channel::Control, &endpoint(info, info.control_port), session_id)
                .await?;
        let stdin = ZmqChannel::dealer(Channel::Stdin, &endpoint(info, info.stdin_port), session_id)
            .await?;
        let iopub = ZmqChannel::subscriber(&endpoint(info, info.iopub_port)).await?;
        let heartbeat = ZmqHeartbeat::start(endpoint(info, info.hb_port));

        Ok(KernelChannels {
            shell: Arc::new(shell),
            iopub: Arc::new(iopub),
            stdin: Arc::new(stdin),
            control: Arc::new(control),
            heartbeat: Arc::new(heartbeat),
        })
    }
}

struct ZmqChannel {
    channel: Channel,
    outbound: Option<mpsc::Sender<Outbound>>,
    inbox: Arc<Inbox>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ZmqChannel {
    async fn dealer(channel: Channel, endpoint: &str, session_id: &str) -> Result<Self> {
        let mut socket = DealerSocket::with_options(dealer_options(session_id)?);
        socket
            .connect(endpoint)
            .await
            .with_context(|| format!("failed to connect {} socket to {}", channel, endpoint))?;
        trace!("[kernel-client] Connected {} socket to {}", channel, endpoint);

        let inbox = Arc::new(Inbox::default());
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let task = tokio::spawn(run_duplex(socket, channel, inbox.clone(), rx));
        Ok(Self {
            channel,
            outbound: Some(tx),
            inbox,
            task: Mutex::new(Some(task)),
        })
    }

    async fn subscriber(endpoint: &str) -> Result<Self> {
        let mut socket = SubSocket::new();
        socket
            .connect(endpoint)
            .await
            .with_context(|| format!("failed to connect iopub socket to {}", endpoint))?;
        socket.subscribe("").await?;
        trace!("[kernel-client] Connected iopub socket to {}", endpoint);

        let inbox = Arc::new(Inbox::default());
        let task = tokio::spawn(run_receive_only(socket, inbox.clone()));
        Ok(Self {
            channel: Channel::IOPub,
            outbound: None,
            inbox,
            task: Mutex::new(Some(task)),
        })
    }
}

#[async_trait]
impl ChannelSocket for ZmqChannel {
    async fn send(&self, frames: Frames) -> Result<()> {
        let Some(outbound) = &self.outbound else {
            anyhow::bail!("{} socket is receive-only", self.channel);
        };
        if self.inbox.is_closed() {
            anyhow::bail!("{} socket is closed", self.channel);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        outbound
            .send((frames, reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("{} socket task has exited", self.channel))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("{} socket task dropped the send", self.channel))?
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
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for ZmqChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_duplex<S>(
    mut socket: S,
    channel: Channel,
    inbox: Arc<Inbox>,
    mut outbound: mpsc::Receiver<Outbound>,
) where
    S: SocketSend + SocketRecv + Send,
{
    loop {
        tokio::select! {
            received = socket.recv() => match received {
                Ok(message) => inbox.push(message.into_vec()),
                Err(e) => {
                    error!("[kernel-client] Failed to receive from {} socket: {}", channel, e);
                    break;
                }
            },
            request = outbound.recv() => match request {
                Some((frames, reply)) => {
                    let result = match to_zmq(frames) {
                        Ok(message) => socket.send(message).await.map_err(anyhow::Error::from),
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                None => break,
            },
        }
    }
    inbox.close();
    debug!("[kernel-client] {} socket task exited", channel);
}

async fn run_receive_only(mut socket: SubSocket, inbox: Arc<Inbox>) {
    loop {
        match socket.recv().await {
            Ok(message) => inbox.push(message.into_vec()),
            Err(e) => {
                error!("[kernel-client] Failed to receive from iopub socket: {}", e);
                break;
            }
        }
    }
    inbox.close();
}

struct ZmqHeartbeat {
    beating: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ZmqHeartbeat {
    fn start(endpoint: String) -> Self {
        let beating = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_heartbeat(endpoint, beating.clone()));
        Self {
            beating,
            task: Mutex::new(Some(task)),
        }
    }
}

impl Heartbeat for ZmqHeartbeat {
    fn is_beating(&self) -> bool {
        self.beating.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.beating.store(false, Ordering::Release);
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for ZmqHeartbeat {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ping the kernel's echo socket forever. A REQ socket that missed a reply
/// cannot send again, so it is replaced after every failure.
async fn run_heartbeat(endpoint: String, beating: Arc<AtomicBool>) {
    loop {
        let mut socket = ReqSocket::new();
        if let Err(e) = socket.connect(&endpoint).await {
            warn!("[kernel-client] Failed to connect heartbeat socket to {}: {}", endpoint, e);
            beating.store(false, Ordering::Release);
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            continue;
        }

        loop {
            if let Err(e) = socket.send(ZmqMessage::from(Bytes::from_static(b"ping"))).await {
                warn!("[kernel-client] Failed to send heartbeat: {}", e);
                beating.store(false, Ordering::Release);
                break;
            }
            match tokio::time::timeout(HEARTBEAT_TIMEOUT, socket.recv()).await {
                Ok(Ok(_)) => beating.store(true, Ordering::Release),
                Ok(Err(e)) => {
                    warn!("[kernel-client] Heartbeat receive failed: {}", e);
                    beating.store(false, Ordering::Release);
                    break;
                }
                Err(_) => {
                    if beating.swap(false, Ordering::AcqRel) {
                        warn!("[kernel-client] Kernel missed a heartbeat at {}", endpoint);
                    }
                    break;
                }
            }
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(transport: &str) -> ConnectionInfo {
        serde_json::from_value(serde_json::json!({
            "ip": "127.0.0.1",
            "transport": transport,
            "shell_port": 5001,
            "iopub_port": 5002,
            "stdin_port": 5003,
            "control_port": 5004,
            "hb_port": 5005,
            "key": "",
            "signature_scheme": "hmac-sha256",
        }))
        .unwrap()
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(endpoint(&info("tcp"), 5001), "tcp://127.0.0.1:5001");
        assert_eq!(endpoint(&info("ipc"), 5002), "ipc://127.0.0.1-5002");
    }

    #[test]
    fn test_to_zmq_preserves_frames() {
        let frames = vec![Bytes::from_static(b"<IDS|MSG>"), Bytes::from_static(b"sig")];
        let message = to_zmq(frames.clone()).unwrap();
        assert_eq!(message.into_vec(), frames);
        assert!(to_zmq(Vec::new()).is_err());
    }
}
