//! Node launchers
//!
//! The scheduler does not know how a node process is started; it asks a
//! [`NodeLauncher`]. [`ProcessLauncher`] runs a local binary per identity,
//! one port each, and confirms liveness by connecting to that port. Each
//! launch mints a node credential the process uses to open its side of the
//! signer relay.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::auth::{CredentialBundle, CredentialStore};
use crate::types::{KeyholeError, NodeId, Result};

/// A node process that has been confirmed live
#[derive(Debug)]
pub struct LaunchedNode {
    pub endpoint: String,
    /// Resolves (or errors) when the process exits
    pub exited: oneshot::Receiver<()>,
}

/// Starts node processes
#[async_trait]
pub trait NodeLauncher: Send + Sync + 'static {
    /// Start a node for `node_id` and return once it accepts connections.
    /// Dropping the returned future must abandon the start.
    async fn launch(&self, node_id: NodeId) -> Result<LaunchedNode>;
}

/// Configuration for [`ProcessLauncher`]
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    /// Node binary to execute
    pub binary: PathBuf,
    /// Extra arguments passed verbatim
    pub args: Vec<String>,
    /// Host the node binds to and the endpoint advertises
    pub host: String,
    /// Base URL the node uses to reach this gateway
    pub gateway_url: String,
    pub port_min: u16,
    pub port_max: u16,
    /// Delay between liveness probes
    pub probe_interval: Duration,
}

impl Default for ProcessLauncherConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("lightningd"),
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
            gateway_url: "http://127.0.0.1:8080".to_string(),
            port_min: 19000,
            port_max: 19999,
            probe_interval: Duration::from_millis(100),
        }
    }
}

/// Port reserved for a node; released on drop
struct PortLease {
    ports: Arc<DashMap<u16, NodeId>>,
    port: u16,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.ports.remove(&self.port);
    }
}

/// Spawns one local process per node identity
pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
    store: Arc<CredentialStore>,
    ports: Arc<DashMap<u16, NodeId>>,
    next_port: AtomicU16,
}

impl ProcessLauncher {
    pub fn new(config: ProcessLauncherConfig, store: Arc<CredentialStore>) -> Self {
        let next_port = AtomicU16::new(config.port_min);
        Self {
            config,
            store,
            ports: Arc::new(DashMap::new()),
            next_port,
        }
    }

    fn lease_port(&self, node_id: NodeId) -> Result<PortLease> {
        let span = u32::from(self.config.port_max - self.config.port_min) + 1;
        for _ in 0..span {
            let candidate = self.next_port.fetch_add(1, Ordering::Relaxed);
            let port = if candidate < self.config.port_min || candidate > self.config.port_max {
                self.next_port
                    .store(self.config.port_min + 1, Ordering::Relaxed);
                self.config.port_min
            } else {
                candidate
            };

            if let dashmap::mapref::entry::Entry::Vacant(v) = self.ports.entry(port) {
                v.insert(node_id);
                return Ok(PortLease {
                    ports: Arc::clone(&self.ports),
                    port,
                });
            }
        }
        Err(KeyholeError::Scheduling("no free node ports".into()))
    }

    pub fn ports_in_use(&self) -> usize {
        self.ports.len()
    }

    /// Command line and environment of a node process
    fn command(
        &self,
        node_id: &NodeId,
        port: u16,
        credential: &CredentialBundle,
    ) -> Result<Command> {
        let certificate = credential.certificate()?.to_header_value()?;
        let mut command = Command::new(&self.config.binary);
        command
            .args(&self.config.args)
            .env("KEYHOLE_NODE_ID", node_id.to_hex())
            .env("KEYHOLE_NODE_PORT", port.to_string())
            .env("KEYHOLE_GATEWAY_URL", &self.config.gateway_url)
            .env("KEYHOLE_NODE_CERT", certificate)
            .env("KEYHOLE_NODE_KEY", hex::encode(&credential.device_key))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl NodeLauncher for ProcessLauncher {
    async fn launch(&self, node_id: NodeId) -> Result<LaunchedNode> {
        let lease = self.lease_port(node_id)?;
        let address = format!("{}:{}", self.config.host, lease.port);

        info!(
            node_id = %node_id,
            binary = %self.config.binary.display(),
            port = lease.port,
            "Spawning node process"
        );

        let credential = self.store.issue_node_credential(&node_id).await.map_err(|e| {
            KeyholeError::Scheduling(format!("cannot issue node credential: {}", e))
        })?;

        let mut child = self
            .command(&node_id, lease.port, &credential)?
            .spawn()
            .map_err(|e| {
                KeyholeError::Scheduling(format!(
                    "failed to spawn {}: {}",
                    self.config.binary.display(),
                    e
                ))
            })?;

        loop {
            if let Some(status) = child.try_wait()? {
                warn!(node_id = %node_id, %status, "Node process exited during startup");
                return Err(KeyholeError::Scheduling(format!(
                    "node exited during startup: {}",
                    status
                )));
            }
            if TcpStream::connect(&address).await.is_ok() {
                break;
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }

        debug!(node_id = %node_id, %address, "Node process accepting connections");

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(node_id = %node_id, %status, "Node process exited"),
                Err(e) => warn!(node_id = %node_id, "Failed waiting on node process: {}", e),
            }
            drop(lease);
            let _ = exit_tx.send(());
        });

        Ok(LaunchedNode {
            endpoint: format!("http://{}", address),
            exited: exit_rx,
        })
    }
}
