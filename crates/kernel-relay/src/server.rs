//! HTTP surface: kernel listing and the per-kernel WebSocket endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use kernel_wire::WireProtocol;
use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::bridge::{
    BridgeConfig, IncomingFrame, KernelWebsocketConnection, SinkError, WebSocketSink,
};
use crate::kernel_manager::{KernelRegistry, KernelSummary};
use crate::listener::MessageFilter;

const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<KernelRegistry>,
    pub default_protocol: WireProtocol,
    pub filter: MessageFilter,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/kernels", get(list_kernels))
        .route("/api/kernels/:kernel_id/channels", get(kernel_channels))
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("[relay] Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("[relay] Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("[relay] Shutting down");
        })
        .await?;
    Ok(())
}

async fn list_kernels(State(state): State<AppState>) -> Json<Vec<KernelSummary>> {
    Json(state.registry.list())
}

fn offered_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

async fn kernel_channels(
    State(state): State<AppState>,
    Path(kernel_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.registry.get(&kernel_id).is_none() {
        return (StatusCode::NOT_FOUND, format!("kernel {} not found", kernel_id)).into_response();
    }

    let offered = offered_subprotocols(&headers);
    let protocol = WireProtocol::negotiate(offered.iter().map(String::as_str), state.default_protocol);
    let ws = match protocol.subprotocol() {
        Some(subprotocol) => ws.protocols([subprotocol]),
        None => ws,
    };

    let config = BridgeConfig {
        protocol,
        filter: state.filter.clone(),
    };
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, registry, kernel_id, config))
}

/// Writes to the socket through a bounded queue drained by a writer task.
///
/// Writes never wait: a browser that stops reading has messages dropped
/// once its queue is full, so it cannot hold up the kernel's receive loops.
struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl WebSocketSink for ChannelSink {
    async fn write_message(&self, data: Vec<u8>, binary: bool) -> Result<(), SinkError> {
        let message = if binary {
            Message::Binary(data)
        } else {
            Message::Text(String::from_utf8(data).map_err(|e| SinkError::Io(e.to_string()))?)
        };
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

async fn handle_socket(
    socket: WebSocket,
    registry: Arc<KernelRegistry>,
    kernel_id: String,
    config: BridgeConfig,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let protocol = config.protocol;
    let bridge = KernelWebsocketConnection::new(
        kernel_id.clone(),
        registry,
        Arc::new(ChannelSink { tx }),
        config,
    );
    if let Err(e) = bridge.connect().await {
        error!("[relay] Could not attach websocket to kernel {}: {}", kernel_id, e);
        writer.abort();
        return;
    }
    info!("[relay] Websocket opened for kernel {} ({})", kernel_id, protocol);

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                bridge
                    .handle_incoming_message(IncomingFrame::Binary(Bytes::from(data)))
                    .await
            }
            Ok(Message::Text(text)) => {
                bridge.handle_incoming_message(IncomingFrame::Text(text)).await
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!("[relay] Websocket error for kernel {}: {}", kernel_id, e);
                break;
            }
        }
    }

    bridge.disconnect();
    writer.abort();
    info!("[relay] Websocket closed for kernel {}", kernel_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::client::{ClientConfig, SharedKernelClient};
    use crate::listener::KernelListener;
    use crate::session::Session;
    use crate::transport::MemoryConnector;
    use axum::http::HeaderValue;
    use kernel_wire::MessageParts;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        count: AtomicUsize,
    }

    #[async_trait]
    impl KernelListener for Counter {
        async fn handle_outgoing_message(&self, _: Channel, _: MessageParts) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_offered_subprotocols() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("chat, v1.kernel.websocket.jupyter.org"),
        );
        let offered = offered_subprotocols(&headers);
        assert_eq!(offered, vec!["chat", "v1.kernel.websocket.jupyter.org"]);
        assert_eq!(
            WireProtocol::negotiate(offered.iter().map(String::as_str), WireProtocol::JsonLayout),
            WireProtocol::V1
        );
        assert!(offered_subprotocols(&HeaderMap::new()).is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_reports_full_without_waiting() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = ChannelSink { tx };
        assert!(sink.write_message(vec![1], true).await.is_ok());
        let second = tokio::time::timeout(Duration::from_secs(1), sink.write_message(vec![2], true))
            .await
            .expect("write must not wait for the reader");
        assert!(matches!(second, Err(SinkError::Full)));
    }

    #[tokio::test]
    async fn test_stalled_socket_does_not_block_other_listeners() {
        let (connector, _kernel) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let registry = Arc::new(KernelRegistry::new(connector.clone(), ClientConfig::default()));
        let client = SharedKernelClient::new("k1", connector, ClientConfig::default());

        // A browser that never reads its socket.
        let (tx, _rx) = mpsc::channel(1);
        let stalled = KernelWebsocketConnection::new(
            "k1",
            registry,
            Arc::new(ChannelSink { tx }),
            BridgeConfig::default(),
        );
        client.add_listener_with_filter(stalled, MessageFilter::All);
        let counter = Arc::new(Counter::default());
        client.add_listener_with_filter(counter.clone(), MessageFilter::All);

        let session = Session::unsigned("kernel");
        for i in 0..3 {
            let stream = session.message(
                "stream",
                None,
                serde_json::json!({"name": "stdout", "text": format!("line {}\n", i)}),
            );
            tokio::time::timeout(
                Duration::from_secs(1),
                client.handle_outgoing_message(Channel::IOPub, stream),
            )
            .await
            .expect("fan-out must not wait on a stalled socket");
        }
        assert_eq!(counter.count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        let sink = ChannelSink { tx };
        drop(rx);
        assert!(matches!(
            sink.write_message(vec![1], true).await,
            Err(SinkError::Closed)
        ));
    }
}
