//! TFTP Server Implementation
//!
//! This module contains the main TFTP server logic that handles incoming
//! requests and spawns a transfer session for each of them.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::{self, JoinSet};
use tracing::Instrument;

use crate::protocol::Packet;
use crate::stream::FileResolver;
use crate::transfer::{Opening, ServeSettings, TransferConfig, TransferContext, create_ephemeral_socket};

/// Buffer for initial requests on the listening socket
const REQUEST_BUFFER_SIZE: usize = 2048;

/// Clients with a session in flight, tracked by the task serving them
///
/// A resent request from a client listed here must not start another session.
#[derive(Debug, Default)]
struct ActiveSessions {
    by_client: HashMap<SocketAddr, task::Id>,
    by_task: HashMap<task::Id, SocketAddr>,
}

impl ActiveSessions {
    fn contains(&self, client: &SocketAddr) -> bool {
        self.by_client.contains_key(client)
    }

    fn insert(&mut self, client: SocketAddr, id: task::Id) {
        self.by_client.insert(client, id);
        self.by_task.insert(id, client);
    }

    /// Forget the session run by task `id`, however it ended
    fn finish(&mut self, id: task::Id) -> Option<SocketAddr> {
        let client = self.by_task.remove(&id)?;
        self.by_client.remove(&client);
        Some(client)
    }
}

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub root_directory: PathBuf,
    pub transfer_config: TransferConfig,
    /// Answer `tsize` with real sizes instead of the placeholder
    pub report_transfer_size: bool,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6969".to_string(),
            root_directory: PathBuf::from("./tftp_root"),
            transfer_config: TransferConfig::default(),
            report_transfer_size: false,
        }
    }
}

/// Main TFTP server
pub struct TftpServer {
    config: TftpServerConfig,
    resolver: Option<Arc<dyn FileResolver>>,
    socket: Option<UdpSocket>,
}

impl TftpServer {
    /// Create a new TFTP server with the given configuration
    pub fn new(config: TftpServerConfig) -> Self {
        Self {
            config,
            resolver: None,
            socket: None,
        }
    }

    /// Create a new TFTP server with default configuration
    pub fn with_defaults() -> Self {
        Self::new(TftpServerConfig::default())
    }

    /// Create a new TFTP server with custom bind address and root directory
    pub fn with_config(bind_address: String, root_directory: PathBuf) -> Self {
        Self::new(TftpServerConfig {
            bind_address,
            root_directory,
            ..Default::default()
        })
    }

    /// Serve content from `resolver` for reads of files missing under the root
    pub fn with_resolver(mut self, resolver: impl FileResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Get the server's configuration
    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    /// Get a mutable reference to the server's configuration
    pub fn config_mut(&mut self) -> &mut TftpServerConfig {
        &mut self.config
    }

    /// Bind the listening socket and return its address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind TFTP server socket to {}", self.config.bind_address))?;

        let local_addr = socket.local_addr().context("Failed to get local address")?;
        tracing::info!(
            "TFTP server listening on {}, serving files from {}",
            local_addr,
            self.config.root_directory.display()
        );

        self.socket = Some(socket);
        Ok(local_addr)
    }

    /// Get the local address the server is bound to (if bound)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Start the TFTP server and serve until the process ends
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then wait for in-flight transfers
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.socket.is_none() {
            self.bind().await?;
        }
        let socket = self.socket.as_ref().context("TFTP server socket is not bound")?;

        let settings = Arc::new(ServeSettings {
            root: self.config.root_directory.clone(),
            resolver: self.resolver.clone(),
            report_transfer_size: self.config.report_transfer_size,
        });

        let mut sessions = JoinSet::new();
        let mut active = ActiveSessions::default();
        let mut buffer = [0u8; REQUEST_BUFFER_SIZE];
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down, waiting for {} active transfers", sessions.len());
                    break;
                }
                received = socket.recv_from(&mut buffer) => {
                    let (len, client) = received.context("Failed to receive on TFTP server socket")?;
                    if active.contains(&client) {
                        tracing::debug!("Ignoring request from {}, a transfer is already running", client);
                        continue;
                    }
                    if let Some(id) = self.accept(&buffer[..len], client, &settings, &mut sessions) {
                        active.insert(client, id);
                    }
                }
                Some(joined) = sessions.join_next_with_id(), if !sessions.is_empty() => {
                    let id = match joined {
                        Ok((id, ())) => id,
                        Err(e) => {
                            tracing::error!("Transfer task panicked: {}", e);
                            e.id()
                        }
                    };
                    active.finish(id);
                }
            }
        }

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Transfer task panicked: {}", e);
            }
        }

        tracing::info!("TFTP server stopped");
        Ok(())
    }

    /// Decode an initial datagram and start a session for it
    ///
    /// Returns the id of the spawned session task, if any.
    fn accept(
        &self,
        datagram: &[u8],
        client: SocketAddr,
        settings: &Arc<ServeSettings>,
        sessions: &mut JoinSet<()>,
    ) -> Option<task::Id> {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Ignoring malformed packet from {}: {}", client, e);
                return None;
            }
        };
        tracing::info!("{} from {}", packet, client);

        let config = self.config.transfer_config.clone();
        let settings = Arc::clone(settings);
        let span = tracing::info_span!("tftp", role = "server", peer = %client);

        let handle = sessions.spawn(
            async move {
                let socket = match create_ephemeral_socket(client, config.local_bind).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        tracing::warn!("Failed to create transfer socket for {}: {}", client, e);
                        return;
                    }
                };

                let ctx = TransferContext::server(socket, client, settings, config);
                match ctx.run(Opening::Receive(packet, client)).await {
                    Ok(metrics) => tracing::info!("Transfer with {} complete: {}", client, metrics),
                    Err(failure) => {
                        tracing::warn!("Transfer with {} failed: {} ({})", client, failure.error, failure.metrics)
                    }
                }
            }
            .instrument(span),
        );
        Some(handle.id())
    }
}

/// Run a TFTP server with the given bind address and root directory
///
/// This is a convenience function that creates and runs a TFTP server.
pub async fn serve_forever(
    listen_addr: String,
    root_directory: PathBuf,
    resolver: Option<Arc<dyn FileResolver>>,
) -> Result<()> {
    let mut server = TftpServer::with_config(listen_addr, root_directory);
    server.resolver = resolver;
    server.run().await
}
