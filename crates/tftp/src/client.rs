//! TFTP Client
//!
//! Downloads and uploads over a fresh ephemeral socket per transfer.
//!
//! ```rust,no_run
//! use tftp::{Sink, TftpClient, TftpOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = TftpClient::new("192.168.1.10", 69);
//!     let options: TftpOptions = [("blksize", "1428")].into_iter().collect();
//!     let metrics = client.download("pxelinux.0", Sink::create("pxelinux.0").await?, options).await?;
//!     println!("{metrics}");
//!     Ok(())
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{UdpSocket, lookup_host};
use tracing::Instrument;

use crate::error::{TransferError, TransferFailure};
use crate::metrics::SessionMetrics;
use crate::protocol::{Packet, TftpOptions};
use crate::stream::{Sink, Source, TransferStream};
use crate::transfer::{Opening, PacketHook, Role, TransferConfig, TransferContext, create_ephemeral_socket};

/// Well-known TFTP port
pub const DEFAULT_PORT: u16 = 69;

/// TFTP client bound to one server
#[derive(Clone)]
pub struct TftpClient {
    host: String,
    port: u16,
    config: TransferConfig,
    hook: Option<PacketHook>,
}

impl TftpClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            config: TransferConfig::default(),
            hook: None,
        }
    }

    pub fn with_config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    /// Call `hook` with every packet received from the server
    pub fn with_hook(mut self, hook: PacketHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Fetch `filename` from the server into `sink`
    pub async fn download(
        &self,
        filename: &str,
        sink: Sink,
        options: TftpOptions,
    ) -> Result<SessionMetrics, TransferFailure> {
        let (socket, remote) = self.connect().await.map_err(early_failure)?;
        tracing::info!("Sending tftp download request to {} for '{}'", remote, filename);

        let request = Packet::read_request(filename, options.clone());
        let ctx = TransferContext::client(
            Role::ClientDownload,
            socket,
            remote,
            TransferStream::sink(sink),
            options,
            self.config.clone(),
            self.hook.clone(),
        );

        let span = tracing::info_span!("tftp", role = "download", file = %filename, peer = %remote);
        ctx.run(Opening::Send(request)).instrument(span).await
    }

    /// Send the contents of `source` to the server as `filename`
    pub async fn upload(
        &self,
        filename: &str,
        source: Source,
        options: TftpOptions,
    ) -> Result<SessionMetrics, TransferFailure> {
        let (socket, remote) = self.connect().await.map_err(early_failure)?;
        tracing::info!("Sending tftp upload request to {} for '{}'", remote, filename);

        let request = Packet::write_request(filename, options.clone());
        let ctx = TransferContext::client(
            Role::ClientUpload,
            socket,
            remote,
            TransferStream::source(source),
            options,
            self.config.clone(),
            self.hook.clone(),
        );

        let span = tracing::info_span!("tftp", role = "upload", file = %filename, peer = %remote);
        ctx.run(Opening::Send(request)).instrument(span).await
    }

    /// Resolve the server and bind a socket of the matching family
    async fn connect(&self) -> io::Result<(UdpSocket, SocketAddr)> {
        let remote = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for host {}", self.host)))?;

        let socket = create_ephemeral_socket(remote, self.config.local_bind).await?;
        Ok((socket, remote))
    }
}

/// A failure before any packet was exchanged
fn early_failure(error: io::Error) -> TransferFailure {
    let mut metrics = SessionMetrics::new();
    metrics.finish();
    TransferFailure {
        error: TransferError::Io(error),
        metrics,
    }
}

/// Download `filename` from `host:port` into `sink`
pub async fn download(
    host: &str,
    port: u16,
    filename: &str,
    sink: Sink,
    options: TftpOptions,
    hook: Option<PacketHook>,
    timeout: Duration,
) -> Result<SessionMetrics, TransferFailure> {
    client_for(host, port, hook, timeout).download(filename, sink, options).await
}

/// Upload `source` to `host:port` as `filename`
pub async fn upload(
    host: &str,
    port: u16,
    filename: &str,
    source: Source,
    options: TftpOptions,
    hook: Option<PacketHook>,
    timeout: Duration,
) -> Result<SessionMetrics, TransferFailure> {
    client_for(host, port, hook, timeout).upload(filename, source, options).await
}

fn client_for(host: &str, port: u16, hook: Option<PacketHook>, timeout: Duration) -> TftpClient {
    let client = TftpClient::new(host, port).with_config(TransferConfig {
        timeout,
        ..Default::default()
    });
    match hook {
        Some(hook) => client.with_hook(hook),
        None => client,
    }
}
