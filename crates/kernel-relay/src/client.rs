//! One kernel connection shared by every frontend attached to a kernel.
//!
//! Frontend messages flow in through [`SharedKernelClient::handle_incoming_message`],
//! get their channel encoded into the msg_id and are sent to the kernel (or
//! queued until the connection is ready). Kernel messages are read by one
//! receive loop per channel and fanned out to every registered
//! [`KernelListener`] whose filter accepts them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use jupyter_protocol::ConnectionInfo;
use kernel_wire::{header::parse_part, peek_header, MessageParts, MIN_MESSAGE_PARTS};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::channel::Channel;
use crate::execution_state::{ExecutionState, StateTracker};
use crate::listener::{ConflictingFilters, KernelListener, ListenerId, ListenerRegistry, MessageFilter, MsgTypeChannel};
use crate::msg_id;
use crate::queue::MessageQueue;
use crate::session::{Session, SessionError};
use crate::transport::{ChannelSocket, KernelChannels, KernelConnector};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot specify both msg_types and exclude_msg_types")]
    ConflictingFilters,

    #[error("channel {0} does not accept messages from frontends")]
    UnsupportedChannel(Channel),

    #[error("kernel client is not connected")]
    NotConnected,

    #[error("no connection info loaded")]
    MissingConnectionInfo,

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl From<ConflictingFilters> for ClientError {
    fn from(_: ConflictingFilters) -> Self {
        ClientError::ConflictingFilters
    }
}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        ClientError::Transport(e.into())
    }
}

/// Timing and sizing knobs for a [`SharedKernelClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for a whole `connect()` attempt.
    pub connect_timeout: Duration,
    pub connection_test_timeout: Duration,
    pub connection_test_check_interval: Duration,
    pub connection_test_retry_interval: Duration,
    /// Pause between the heartbeat coming up and the first kernel_info request.
    pub connection_test_grace: Duration,
    pub heartbeat_check_interval: Duration,
    pub heartbeat_max_attempts: u32,
    /// Sleep of an idle receive loop.
    pub recv_poll_interval: Duration,
    pub max_queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(150),
            connection_test_timeout: Duration::from_secs(120),
            connection_test_check_interval: Duration::from_millis(100),
            connection_test_retry_interval: Duration::from_secs(10),
            connection_test_grace: Duration::from_millis(500),
            heartbeat_check_interval: Duration::from_millis(100),
            heartbeat_max_attempts: 10,
            recv_poll_interval: Duration::from_millis(10),
            max_queue_size: 1000,
        }
    }
}

/// Where a client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Unconnected,
    Connecting,
    Connected,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SharedKernelClient {
    kernel_id: String,
    session_id: String,
    config: ClientConfig,
    connector: Arc<dyn KernelConnector>,
    connection_info: Mutex<Option<ConnectionInfo>>,
    session: Mutex<Arc<Session>>,
    channels: Mutex<Option<Arc<KernelChannels>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<ListenerRegistry>,
    queue: Mutex<MessageQueue>,
    tracker: Mutex<StateTracker>,
    ready: AtomicBool,
    // Held while flushing the queue and while sending live, so that queued
    // messages always reach the kernel first.
    send_gate: tokio::sync::Mutex<()>,
    phase: watch::Sender<ConnectionPhase>,
    // Bumped by every disconnect; a connect attempt started under an older
    // value is abandoned.
    generation: watch::Sender<u64>,
    // Held by a connect attempt while it settles and by disconnect while it
    // tears down, so the two never interleave.
    lifecycle: tokio::sync::Mutex<()>,
}

impl SharedKernelClient {
    pub fn new(
        kernel_id: impl Into<String>,
        connector: Arc<dyn KernelConnector>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let session_id = Uuid::new_v4().to_string();
        let (phase, _) = watch::channel(ConnectionPhase::Unconnected);
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            kernel_id: kernel_id.into(),
            session: Mutex::new(Arc::new(Session::unsigned(session_id.clone()))),
            session_id,
            queue: Mutex::new(MessageQueue::new(config.max_queue_size)),
            config,
            connector,
            connection_info: Mutex::new(None),
            channels: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            listeners: Mutex::new(ListenerRegistry::new()),
            tracker: Mutex::new(StateTracker::new()),
            ready: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            phase,
            generation,
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Set the ports and key of the kernel to talk to. Takes effect on the
    /// next connect.
    pub fn load_connection_info(&self, info: ConnectionInfo) {
        *lock(&self.connection_info) = Some(info);
    }

    pub fn execution_state(&self) -> ExecutionState {
        lock(&self.tracker).state()
    }

    pub fn last_activity(&self) -> Option<Instant> {
        lock(&self.tracker).last_activity()
    }

    /// Whether messages are sent straight to the kernel rather than queued.
    pub fn is_connected(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    pub fn queued_len(&self) -> usize {
        lock(&self.queue).len()
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a listener. At most one of `msg_types` and
    /// `exclude_msg_types` may be given.
    pub fn add_listener(
        &self,
        listener: Arc<dyn KernelListener>,
        msg_types: Option<Vec<MsgTypeChannel>>,
        exclude_msg_types: Option<Vec<MsgTypeChannel>>,
    ) -> Result<ListenerId, ClientError> {
        let filter = MessageFilter::from_lists(msg_types, exclude_msg_types)?;
        Ok(self.add_listener_with_filter(listener, filter))
    }

    pub fn add_listener_with_filter(
        &self,
        listener: Arc<dyn KernelListener>,
        filter: MessageFilter,
    ) -> ListenerId {
        let id = lock(&self.listeners).insert(listener, filter);
        debug!("[kernel-client] Added {} to kernel {}", id, self.kernel_id);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = lock(&self.listeners).remove(id);
        if removed {
            debug!("[kernel-client] Removed {} from kernel {}", id, self.kernel_id);
        }
        removed
    }

    pub fn clear_listeners(&self) {
        lock(&self.listeners).clear();
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    // ========================================================================
    // Frontend -> kernel
    // ========================================================================

    /// Accept a message from a frontend for the kernel.
    ///
    /// The channel is encoded into the msg_id. Until the connection is ready
    /// the message is queued instead of sent.
    pub async fn handle_incoming_message(
        &self,
        channel: Channel,
        parts: MessageParts,
    ) -> Result<(), ClientError> {
        if !channel.accepts_requests() {
            return Err(ClientError::UnsupportedChannel(channel));
        }
        if parts.is_empty() {
            return Ok(());
        }
        let parts = msg_id::encode_channel_in_header(parts, channel.as_str());

        {
            let mut queue = lock(&self.queue);
            if !self.ready.load(Ordering::Acquire) {
                queue.push(channel, parts);
                return Ok(());
            }
        }

        let _gate = self.send_gate.lock().await;
        self.send_now(channel, parts).await
    }

    /// Mark the connection ready and send everything queued so far, in order.
    pub async fn mark_connection_ready(&self) {
        let _gate = self.send_gate.lock().await;
        let queued = {
            let mut queue = lock(&self.queue);
            if self.ready.swap(true, Ordering::AcqRel) {
                return;
            }
            queue.drain()
        };

        if !queued.is_empty() {
            info!(
                "[kernel-client] Processing {} queued messages for kernel {}",
                queued.len(),
                self.kernel_id
            );
        }
        for (channel, parts) in queued {
            if let Err(e) = self.send_now(channel, parts).await {
                error!("[kernel-client] Error sending queued {} message: {}", channel, e);
            }
        }
    }

    async fn send_now(&self, channel: Channel, parts: MessageParts) -> Result<(), ClientError> {
        let channels = lock(&self.channels).clone().ok_or(ClientError::NotConnected)?;
        let socket = channels
            .socket(channel)
            .ok_or(ClientError::UnsupportedChannel(channel))?
            .clone();
        let session = lock(&self.session).clone();
        socket.send(session.serialize(&parts)).await?;
        Ok(())
    }

    // ========================================================================
    // Kernel -> frontends
    // ========================================================================

    /// Deliver a message to every listener whose filter accepts it.
    ///
    /// Listeners run concurrently; one failing does not affect the others.
    pub async fn handle_outgoing_message(&self, channel: Channel, parts: MessageParts) {
        if parts.len() < MIN_MESSAGE_PARTS {
            warn!(
                "[kernel-client] Cannot route malformed message on {}: {} parts (expected at least {})",
                channel,
                parts.len(),
                MIN_MESSAGE_PARTS
            );
            return;
        }
        let msg_type = match peek_header(&parts[0]) {
            Ok(header) => header.msg_type,
            Err(e) => {
                debug!("[kernel-client] Cannot read header of {} message: {}", channel, e);
                return;
            }
        };

        let listeners = lock(&self.listeners).matching(&msg_type, channel);
        if listeners.is_empty() {
            return;
        }

        join_all(listeners.into_iter().map(|(id, listener)| {
            let parts = parts.clone();
            let msg_type = msg_type.as_str();
            async move {
                if let Err(e) = listener.handle_outgoing_message(channel, parts).await {
                    warn!(
                        "[kernel-client] {} failed to handle {} on {}: {}",
                        id, msg_type, channel, e
                    );
                }
            }
        }))
        .await;
    }

    /// Send the current execution state to all listeners as an iopub
    /// `status` message. Nothing is sent while the state is unknown.
    pub async fn broadcast_state(&self) {
        let Some(state) = lock(&self.tracker).broadcastable() else {
            debug!("[kernel-client] Skipping broadcast_state - execution state is unknown");
            return;
        };
        let session = lock(&self.session).clone();
        let parts = session.message(
            "status",
            None,
            json!({ "execution_state": state.as_str() }),
        );
        self.handle_outgoing_message(Channel::IOPub, parts).await;
    }

    async fn process_frames(&self, channel: Channel, frames: Vec<bytes::Bytes>) {
        let session = lock(&self.session).clone();
        let parts = match session.deserialize(frames) {
            Ok(parts) => parts,
            Err(SessionError::TooFewParts(n)) => {
                warn!("[kernel-client] Received malformed message on {}: {} parts", channel, n);
                return;
            }
            Err(e) => {
                warn!("[kernel-client] Dropping message on {}: {}", channel, e);
                return;
            }
        };

        if let Err(e) = self.update_execution_state(channel, &parts) {
            debug!("[kernel-client] Error processing message in {}: {}", channel, e);
        }
        self.handle_outgoing_message(channel, parts).await;
    }

    fn update_execution_state(
        &self,
        channel: Channel,
        parts: &MessageParts,
    ) -> Result<(), kernel_wire::WireError> {
        if channel != Channel::IOPub || peek_header(&parts[0])?.msg_type != "status" {
            return Ok(());
        }
        let parent = peek_header(&parts[1])?;
        let content = parse_part(&parts[3])?;
        let execution_state = content.get("execution_state").and_then(|s| s.as_str());
        lock(&self.tracker).observe_status(channel, parent.msg_id(), execution_state);
        Ok(())
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Open the kernel sockets and start one receive loop per channel,
    /// without waiting for the kernel to answer.
    pub async fn start_channels(self: &Arc<Self>) -> Result<(), ClientError> {
        let info = lock(&self.connection_info)
            .clone()
            .ok_or(ClientError::MissingConnectionInfo)?;
        let session = Arc::new(Session::new(self.session_id.clone(), &info)?);
        let channels = Arc::new(self.connector.open(&info, &self.session_id).await?);

        self.stop_receive_loops().await;
        *lock(&self.session) = session;
        if let Some(previous) = lock(&self.channels).replace(channels.clone()) {
            previous.close();
        }

        let mut tasks = lock(&self.tasks);
        for channel in Channel::MESSAGE_CHANNELS {
            let Some(socket) = channels.socket(channel) else {
                continue;
            };
            if !socket.is_alive() {
                continue;
            }
            tasks.push(tokio::spawn(receive_loop(
                Arc::downgrade(self),
                channel,
                socket.clone(),
                self.config.recv_poll_interval,
            )));
        }
        info!(
            "[kernel-client] Started listening on kernel {} with {} listeners",
            self.kernel_id,
            self.listener_count()
        );
        Ok(())
    }

    /// Connect to the kernel and verify it answers.
    ///
    /// Concurrent callers share a single attempt; a connected client
    /// returns `true` right away. A [`disconnect`](Self::disconnect) while
    /// the attempt is in flight cancels it, and every caller gets `false`.
    pub async fn connect(self: &Arc<Self>) -> bool {
        let mut phase_rx = self.phase.subscribe();
        let mut claimed = false;
        let mut generation = 0;
        self.phase.send_if_modified(|phase| {
            if *phase == ConnectionPhase::Unconnected {
                *phase = ConnectionPhase::Connecting;
                claimed = true;
                generation = *self.generation.borrow();
                true
            } else {
                false
            }
        });

        if !claimed {
            return match phase_rx.wait_for(|p| *p != ConnectionPhase::Connecting).await {
                Ok(phase) => *phase == ConnectionPhase::Connected,
                Err(_) => false,
            };
        }

        let mut generation_rx = self.generation.subscribe();
        let _lifecycle = self.lifecycle.lock().await;
        if *generation_rx.borrow_and_update() != generation {
            // Disconnected before the attempt started; disconnect resets the phase.
            return false;
        }

        let attempt = tokio::select! {
            result = tokio::time::timeout(self.config.connect_timeout, self.establish()) => result,
            _ = generation_rx.wait_for(|g| *g != generation) => {
                info!("[kernel-client] Connect to kernel {} cancelled by disconnect", self.kernel_id);
                // Disconnect is waiting on the lifecycle lock and resets the phase.
                return false;
            }
        };

        let connected = match attempt {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("[kernel-client] Failed to connect to kernel {}: {}", self.kernel_id, e);
                false
            }
            Err(_) => {
                error!(
                    "[kernel-client] Connecting to kernel {} timed out after {:?}",
                    self.kernel_id, self.config.connect_timeout
                );
                false
            }
        };

        if connected {
            info!("[kernel-client] Successfully connected to kernel {}", self.kernel_id);
            self.phase.send_replace(ConnectionPhase::Connected);
        } else {
            self.close_channels().await;
            self.phase.send_replace(ConnectionPhase::Unconnected);
        }
        connected
    }

    async fn establish(self: &Arc<Self>) -> Result<(), ClientError> {
        lock(&self.tracker).set_state(ExecutionState::Busy);

        self.start_channels().await?;
        self.wait_for_heartbeat().await?;

        if !self.test_kernel_communication().await {
            return Err(ClientError::Transport(anyhow::anyhow!(
                "kernel communication test failed after {:?}",
                self.config.connection_test_timeout
            )));
        }

        self.mark_connection_ready().await;

        // A status message may already have moved the state on.
        let mut tracker = lock(&self.tracker);
        if tracker.state() == ExecutionState::Busy {
            tracker.set_state(ExecutionState::Idle);
        }
        Ok(())
    }

    async fn wait_for_heartbeat(&self) -> Result<(), ClientError> {
        let heartbeat = lock(&self.channels)
            .as_ref()
            .map(|c| c.heartbeat.clone())
            .ok_or(ClientError::NotConnected)?;

        let mut attempt = 0;
        while !heartbeat.is_beating() {
            attempt += 1;
            if attempt > self.config.heartbeat_max_attempts {
                return Err(ClientError::Transport(anyhow::anyhow!(
                    "the kernel took too long to connect to the kernel sockets"
                )));
            }
            tokio::time::sleep(self.config.heartbeat_check_interval).await;
        }
        Ok(())
    }

    /// Send kernel_info requests on shell and control until
    /// it shows signs of life.
    ///
    /// Succeeds when the state is idle, or when any shell- or
    /// control-parented status arrived after the test began (a kernel busy
    /// with a long execution still answers on control).
    async fn test_kernel_communication(&self) -> bool {
        let started = Instant::now();
        info!("[kernel-client] Starting kernel communication test for {}", self.kernel_id);

        tokio::time::sleep(self.config.connection_test_grace).await;

        self.send_kernel_info_requests().await;
        let mut last_request = Instant::now();

        while started.elapsed() < self.config.connection_test_timeout {
            {
                let tracker = lock(&self.tracker);
                if tracker.state() == ExecutionState::Idle {
                    info!("[kernel-client] Kernel communication test succeeded: execution state is idle");
                    return true;
                }
                if tracker.responded_since(started) {
                    info!("[kernel-client] Kernel communication test succeeded: received status message");
                    return true;
                }
            }

            if last_request.elapsed() >= self.config.connection_test_retry_interval {
                debug!(
                    "[kernel-client] Sending kernel_info requests (elapsed: {:.1}s)",
                    started.elapsed().as_secs_f64()
                );
                self.send_kernel_info_requests().await;
                last_request = Instant::now();
            }

            tokio::time::sleep(self.config.connection_test_check_interval).await;
        }

        error!(
            "[kernel-client] Kernel communication test failed: no response after {:?}",
            self.config.connection_test_timeout
        );
        false
    }

    async fn send_kernel_info_requests(&self) {
        let session = lock(&self.session).clone();
        let requests = [Channel::Shell, Channel::Control].map(|channel| {
            let parts = session.message("kernel_info_request", None, json!({}));
            let parts = msg_id::encode_channel_in_header(parts, channel.as_str());
            async move {
                if let Err(e) = self.send_now(channel, parts).await {
                    debug!("[kernel-client] Error sending kernel_info on {}: {}", channel, e);
                }
            }
        });
        join_all(requests).await;
    }

    async fn stop_receive_loops(&self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("[kernel-client] Receive loop ended abnormally: {}", e),
            }
        }
    }

    async fn close_channels(&self) {
        self.stop_receive_loops().await;
        if let Some(channels) = lock(&self.channels).take() {
            channels.close();
        }
        self.ready.store(false, Ordering::Release);
    }

    /// Stop receiving, close the kernel sockets and reset readiness.
    /// Listeners stay registered for a later reconnect.
    ///
    /// A connect attempt in flight is cancelled first.
    pub async fn disconnect(&self) {
        self.generation.send_modify(|g| *g += 1);
        let _lifecycle = self.lifecycle.lock().await;
        self.close_channels().await;
        self.phase.send_replace(ConnectionPhase::Unconnected);
        info!("[kernel-client] Disconnected from kernel {}", self.kernel_id);
    }

    pub async fn reconnect(self: &Arc<Self>) -> bool {
        info!("[kernel-client] Reconnecting to kernel {}...", self.kernel_id);
        self.disconnect().await;
        self.connect().await
    }

    /// Forget status timestamps ahead of a kernel restart.
    pub fn reset_activity(&self) {
        lock(&self.tracker).reset_activity();
    }

    /// Force the execution state, e.g. `restarting` while the manager
    /// restarts the kernel process.
    pub fn set_execution_state(&self, state: ExecutionState) {
        lock(&self.tracker).set_state(state);
    }
}

impl Drop for SharedKernelClient {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(channels) = lock(&self.channels).take() {
            channels.close();
        }
    }
}

async fn receive_loop(
    client: Weak<SharedKernelClient>,
    channel: Channel,
    socket: Arc<dyn ChannelSocket>,
    poll_interval: Duration,
) {
    while socket.is_alive() {
        if !socket.msg_ready() {
            tokio::time::sleep(poll_interval).await;
            continue;
        }
        let frames = match socket.recv_multipart().await {
            Ok(frames) => frames,
            Err(e) => {
                debug!("[kernel-client] Error receiving on {}: {}", channel, e);
                continue;
            }
        };
        let Some(client) = client.upgrade() else {
            break;
        };
        client.process_frames(channel, frames).await;
    }
    debug!("[kernel-client] Receive loop for {} stopped", channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(Channel, MessageParts)>>,
    }

    #[async_trait]
    impl KernelListener for Recorder {
        async fn handle_outgoing_message(
            &self,
            channel: Channel,
            parts: MessageParts,
        ) -> anyhow::Result<()> {
            self.received.lock().unwrap().push((channel, parts));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl KernelListener for Failing {
        async fn handle_outgoing_message(&self, _: Channel, _: MessageParts) -> anyhow::Result<()> {
            anyhow::bail!("socket gone")
        }
    }

    fn status_parts(state: &str) -> MessageParts {
        Session::unsigned("k").message("status", None, json!({ "execution_state": state }))
    }

    fn client() -> Arc<SharedKernelClient> {
        let (connector, _kernel) = MemoryConnector::new();
        SharedKernelClient::new("k1", Arc::new(connector), ClientConfig::default())
    }

    #[tokio::test]
    async fn test_add_listener_rejects_both_filters() {
        let client = client();
        let result = client.add_listener(
            Arc::new(Recorder::default()),
            Some(vec![("status".into(), Channel::IOPub)]),
            Some(vec![("stream".into(), Channel::IOPub)]),
        );
        assert!(matches!(result, Err(ClientError::ConflictingFilters)));
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_respects_filters() {
        let client = client();
        let everything = Arc::new(Recorder::default());
        let status_only = Arc::new(Recorder::default());
        let no_status = Arc::new(Recorder::default());
        client.add_listener(everything.clone(), None, None).unwrap();
        client
            .add_listener(status_only.clone(), Some(vec![("status".into(), Channel::IOPub)]), None)
            .unwrap();
        client
            .add_listener(no_status.clone(), None, Some(vec![("status".into(), Channel::IOPub)]))
            .unwrap();

        client.handle_outgoing_message(Channel::IOPub, status_parts("busy")).await;
        let stream = Session::unsigned("k").message("stream", None, json!({"text": "hi"}));
        client.handle_outgoing_message(Channel::IOPub, stream).await;

        assert_eq!(everything.received.lock().unwrap().len(), 2);
        assert_eq!(status_only.received.lock().unwrap().len(), 1);
        assert_eq!(no_status.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let client = client();
        let recorder = Arc::new(Recorder::default());
        client.add_listener(Arc::new(Failing), None, None).unwrap();
        client.add_listener(recorder.clone(), None, None).unwrap();

        client.handle_outgoing_message(Channel::IOPub, status_parts("idle")).await;
        assert_eq!(recorder.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_messages_are_not_routed() {
        let client = client();
        let recorder = Arc::new(Recorder::default());
        client.add_listener(recorder.clone(), None, None).unwrap();

        client
            .handle_outgoing_message(Channel::IOPub, vec![Bytes::from_static(b"{}")])
            .await;
        assert!(recorder.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let client = client();
        let recorder = Arc::new(Recorder::default());
        let id = client.add_listener(recorder.clone(), None, None).unwrap();
        assert!(client.remove_listener(id));
        assert!(!client.remove_listener(id));

        client.handle_outgoing_message(Channel::IOPub, status_parts("idle")).await;
        assert!(recorder.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skipped_while_unknown() {
        let client = client();
        let recorder = Arc::new(Recorder::default());
        client.add_listener(recorder.clone(), None, None).unwrap();

        client.broadcast_state().await;
        assert!(recorder.received.lock().unwrap().is_empty());

        client.set_execution_state(ExecutionState::Idle);
        client.broadcast_state().await;
        let received = recorder.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (channel, parts) = &received[0];
        assert_eq!(*channel, Channel::IOPub);
        let content: serde_json::Value = serde_json::from_slice(&parts[3]).unwrap();
        assert_eq!(content["execution_state"], "idle");
    }

    #[tokio::test]
    async fn test_incoming_queued_until_ready() {
        let client = client();
        let parts = Session::unsigned("fe").message("execute_request", None, json!({}));
        client
            .handle_incoming_message(Channel::Shell, parts)
            .await
            .unwrap();
        assert_eq!(client.queued_len(), 1);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_iopub_rejects_incoming() {
        let client = client();
        let result = client
            .handle_incoming_message(Channel::IOPub, status_parts("idle"))
            .await;
        assert!(matches!(result, Err(ClientError::UnsupportedChannel(Channel::IOPub))));
    }

    fn connection_info() -> ConnectionInfo {
        serde_json::from_value(json!({
            "ip": "127.0.0.1",
            "transport": "tcp",
            "shell_port": 0,
            "iopub_port": 0,
            "stdin_port": 0,
            "control_port": 0,
            "hb_port": 0,
            "key": "test-key",
            "signature_scheme": "hmac-sha256",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_disconnect_cancels_connect_in_progress() {
        let (connector, kernel) = MemoryConnector::new();
        let config = ClientConfig {
            connection_test_grace: Duration::from_millis(10),
            connection_test_check_interval: Duration::from_millis(10),
            heartbeat_check_interval: Duration::from_millis(10),
            recv_poll_interval: Duration::from_millis(1),
            ..ClientConfig::default()
        };
        let client = SharedKernelClient::new("k1", Arc::new(connector), config);
        client.load_connection_info(connection_info());

        // Nothing answers yet, so the first attempt hangs in the communication test.
        let (first, ()) = tokio::join!(client.connect(), async {
            while client.phase() != ConnectionPhase::Connecting || kernel.open_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.disconnect().await;
        });
        assert!(!first);
        assert_eq!(client.phase(), ConnectionPhase::Unconnected);
        assert!(!client.is_connected());

        kernel.spawn_responder();
        assert!(client.connect().await);
        assert_eq!(kernel.open_count(), 2);

        // Nothing from the abandoned attempt closes the new connection.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.phase(), ConnectionPhase::Connected);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_start_channels_requires_connection_info() {
        let client = client();
        assert!(matches!(
            client.start_channels().await,
            Err(ClientError::MissingConnectionInfo)
        ));
        assert!(!client.connect().await);
        assert_eq!(client.phase(), ConnectionPhase::Unconnected);
    }
}
