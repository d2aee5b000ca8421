//! Registry of attached kernels, one [`SharedKernelClient`] per kernel id.
//!
//! Kernels are started elsewhere; the registry attaches to them through
//! their connection info, reconnects across restarts and detaches on
//! shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use jupyter_protocol::ConnectionInfo;
use log::{info, warn};
use serde::Serialize;

use crate::client::{ClientConfig, SharedKernelClient};
use crate::execution_state::ExecutionState;
use crate::transport::KernelConnector;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("failed to connect kernel client for kernel {0}")]
    ConnectFailed(String),

    #[error("unknown kernel: {0}")]
    UnknownKernel(String),

    #[error("failed to read connection file {path}: {source}")]
    ConnectionFile {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// What `GET /api/kernels` reports for each kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelSummary {
    pub id: String,
    pub execution_state: ExecutionState,
    pub connected: bool,
    pub connections: usize,
}

pub struct KernelRegistry {
    connector: Arc<dyn KernelConnector>,
    client_config: ClientConfig,
    kernels: RwLock<HashMap<String, Arc<SharedKernelClient>>>,
}

impl KernelRegistry {
    pub fn new(connector: Arc<dyn KernelConnector>, client_config: ClientConfig) -> Self {
        Self {
            connector,
            client_config,
            kernels: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, kernel_id: &str) -> Option<Arc<SharedKernelClient>> {
        self.kernels
            .read()
            .ok()
            .and_then(|kernels| kernels.get(kernel_id).cloned())
    }

    /// Attach to a running kernel and wait until it answers.
    ///
    /// An existing client for `kernel_id` is reused (its listeners stay
    /// registered) and pointed at the new connection info.
    pub async fn attach(
        &self,
        kernel_id: &str,
        info: ConnectionInfo,
    ) -> Result<Arc<SharedKernelClient>, ManagerError> {
        let (client, created) = {
            let mut kernels = self
                .kernels
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match kernels.get(kernel_id) {
                Some(client) => (client.clone(), false),
                None => {
                    let client = SharedKernelClient::new(
                        kernel_id,
                        self.connector.clone(),
                        self.client_config.clone(),
                    );
                    kernels.insert(kernel_id.to_string(), client.clone());
                    (client, true)
                }
            }
        };

        client.load_connection_info(info);
        if !created {
            client.disconnect().await;
        }
        if !client.connect().await {
            if created {
                self.remove(kernel_id);
            }
            return Err(ManagerError::ConnectFailed(kernel_id.to_string()));
        }

        info!("[kernel-manager] Successfully connected kernel client for kernel {}", kernel_id);
        Ok(client)
    }

    /// Read a Jupyter connection file and [`attach`](Self::attach).
    pub async fn attach_connection_file(
        &self,
        kernel_id: &str,
        path: &Path,
    ) -> Result<Arc<SharedKernelClient>, ManagerError> {
        let info = read_connection_file(path).await?;
        info!(
            "[kernel-manager] Attaching kernel {} from {}",
            kernel_id,
            path.display()
        );
        self.attach(kernel_id, info).await
    }

    /// Reconnect after the kernel process restarted. Listeners survive.
    pub async fn restart(&self, kernel_id: &str) -> Result<(), ManagerError> {
        let client = self
            .get(kernel_id)
            .ok_or_else(|| ManagerError::UnknownKernel(kernel_id.to_string()))?;

        info!("[kernel-manager] Restarting kernel client for {}", kernel_id);
        client.reset_activity();
        client.set_execution_state(ExecutionState::Restarting);
        client.broadcast_state().await;

        client.disconnect().await;
        if !client.connect().await {
            client.set_execution_state(ExecutionState::Dead);
            client.broadcast_state().await;
            return Err(ManagerError::ConnectFailed(kernel_id.to_string()));
        }
        client.broadcast_state().await;
        Ok(())
    }

    /// Detach from a kernel: disconnect, drop its listeners and forget it.
    pub async fn shutdown(&self, kernel_id: &str) -> Result<(), ManagerError> {
        let client = self
            .remove(kernel_id)
            .ok_or_else(|| ManagerError::UnknownKernel(kernel_id.to_string()))?;

        info!("[kernel-manager] Disconnecting kernel client for {}", kernel_id);
        client.disconnect().await;
        client.set_execution_state(ExecutionState::Dead);
        client.broadcast_state().await;
        client.clear_listeners();
        Ok(())
    }

    /// Detach from every kernel.
    pub async fn shutdown_all(&self) {
        for id in self.ids() {
            if let Err(e) = self.shutdown(&id).await {
                warn!("[kernel-manager] Failed to shut down {}: {}", id, e);
            }
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .kernels
            .read()
            .map(|kernels| kernels.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn list(&self) -> Vec<KernelSummary> {
        let kernels: Vec<Arc<SharedKernelClient>> = self
            .kernels
            .read()
            .map(|kernels| kernels.values().cloned().collect())
            .unwrap_or_default();
        let mut summaries: Vec<KernelSummary> = kernels
            .iter()
            .map(|client| KernelSummary {
                id: client.kernel_id().to_string(),
                execution_state: client.execution_state(),
                connected: client.is_connected(),
                connections: client.listener_count(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    fn remove(&self, kernel_id: &str) -> Option<Arc<SharedKernelClient>> {
        self.kernels
            .write()
            .ok()
            .and_then(|mut kernels| kernels.remove(kernel_id))
    }
}

/// Parse a Jupyter kernel connection file.
pub async fn read_connection_file(path: &Path) -> Result<ConnectionInfo, ManagerError> {
    let wrap = |source: anyhow::Error| ManagerError::ConnectionFile {
        path: path.to_path_buf(),
        source,
    };
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| wrap(e.into()))?;
    serde_json::from_str(&content).map_err(|e| wrap(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;

    #[tokio::test]
    async fn test_unknown_kernel() {
        let (connector, _kernel) = MemoryConnector::new();
        let registry = KernelRegistry::new(Arc::new(connector), ClientConfig::default());
        assert!(registry.get("nope").is_none());
        assert!(matches!(
            registry.restart("nope").await,
            Err(ManagerError::UnknownKernel(_))
        ));
        assert!(matches!(
            registry.shutdown("nope").await,
            Err(ManagerError::UnknownKernel(_))
        ));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_read_connection_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel-1.json");
        std::fs::write(
            &path,
            r#"{
                "ip": "127.0.0.1",
                "transport": "tcp",
                "shell_port": 50001,
                "iopub_port": 50002,
                "stdin_port": 50003,
                "control_port": 50004,
                "hb_port": 50005,
                "key": "abc",
                "signature_scheme": "hmac-sha256",
                "kernel_name": "python3"
            }"#,
        )
        .unwrap();

        let info = read_connection_file(&path).await.unwrap();
        assert_eq!(info.shell_port, 50001);
        assert_eq!(info.key, "abc");

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            read_connection_file(&missing).await,
            Err(ManagerError::ConnectionFile { .. })
        ));
    }
}
