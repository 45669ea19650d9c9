//! TFTP Transfer Context
//!
//! One [`TransferContext`] exists per transfer. It owns the UDP socket, the
//! negotiated options, the file stream and the metrics, and it drives the
//! state machine in `state.rs` one received datagram at a time.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{TransferError, TransferFailure};
use crate::metrics::SessionMetrics;
use crate::protocol::{BlockSize, Packet, TftpOptions};
use crate::state::SessionState;
use crate::stream::{FileResolver, TransferStream};

const TIMEOUT_SECS: u64 = 3;
const MAX_RETRIES: u32 = 8;

/// Largest datagram we expect: a DATA packet at the maximum block size
const RECV_BUFFER_SIZE: usize = BlockSize::MAX + 4;

/// Callback that sees every packet received from the peer
pub type PacketHook = Arc<dyn Fn(&Packet) + Send + Sync>;

/// Per-transfer timing configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long one receive waits before the last packet is resent
    pub timeout: Duration,
    /// Resends allowed before the transfer fails
    pub max_retries: u32,
    /// Local address for transfer sockets; unspecified when `None`
    pub local_bind: Option<IpAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            local_bind: None,
        }
    }
}

/// Which side of the transfer this context plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    ClientDownload,
    ClientUpload,
    Server,
}

/// Options in force for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct OptionSet {
    pub(crate) blksize: BlockSize,
    /// Advisory transfer size (RFC 2349)
    pub(crate) tsize: Option<u64>,
}

/// Read-only settings shared by every server session
pub(crate) struct ServeSettings {
    pub(crate) root: PathBuf,
    pub(crate) resolver: Option<Arc<dyn FileResolver>>,
    pub(crate) report_transfer_size: bool,
}

/// Result of a single [`TransferContext::cycle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cycle {
    Processed,
    Discarded,
    TimedOut,
}

/// How a session starts
pub(crate) enum Opening {
    /// Client: send the request, then wait for the reply
    Send(Packet),
    /// Server: handle the request that arrived on the listening socket
    Receive(Packet, SocketAddr),
}

pub(crate) struct TransferContext {
    pub(crate) role: Role,
    pub(crate) state: SessionState,
    socket: UdpSocket,
    /// Peer host, plus the port requests go to before the TID is known
    remote: SocketAddr,
    tid: Option<u16>,
    pub(crate) options: OptionSet,
    /// Options the client asked for, used to vet the OACK
    pub(crate) requested: TftpOptions,
    pub(crate) stream: TransferStream,
    next_block: u16,
    retry_count: u32,
    config: TransferConfig,
    pub(crate) pending_complete: bool,
    last_packet_sent: Option<Packet>,
    last_update: Instant,
    pub(crate) metrics: SessionMetrics,
    hook: Option<PacketHook>,
    pub(crate) serve: Option<Arc<ServeSettings>>,
    /// Reused for every receive
    recv_buf: Vec<u8>,
}

impl TransferContext {
    /// Context for a client transfer talking to `remote`
    pub(crate) fn client(
        role: Role,
        socket: UdpSocket,
        remote: SocketAddr,
        stream: TransferStream,
        requested: TftpOptions,
        config: TransferConfig,
        hook: Option<PacketHook>,
    ) -> Self {
        Self::new(role, SessionState::SentRequest, socket, remote, None, stream, requested, config, hook, None)
    }

    /// Context for a server session answering the client at `client`
    pub(crate) fn server(
        socket: UdpSocket,
        client: SocketAddr,
        settings: Arc<ServeSettings>,
        config: TransferConfig,
    ) -> Self {
        Self::new(
            Role::Server,
            SessionState::Idle,
            socket,
            client,
            Some(client.port()),
            TransferStream::Closed,
            TftpOptions::new(),
            config,
            None,
            Some(settings),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        role: Role,
        state: SessionState,
        socket: UdpSocket,
        remote: SocketAddr,
        tid: Option<u16>,
        stream: TransferStream,
        requested: TftpOptions,
        config: TransferConfig,
        hook: Option<PacketHook>,
        serve: Option<Arc<ServeSettings>>,
    ) -> Self {
        Self {
            role,
            state,
            socket,
            remote,
            tid,
            options: OptionSet::default(),
            requested,
            stream,
            next_block: 0,
            retry_count: 0,
            config,
            pending_complete: false,
            last_packet_sent: None,
            last_update: Instant::now(),
            metrics: SessionMetrics::new(),
            hook,
            serve,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    /// Negotiated block size, 512 unless an OACK said otherwise
    pub(crate) fn block_size(&self) -> usize {
        self.options.blksize.get()
    }

    pub(crate) fn next_block(&self) -> u16 {
        self.next_block
    }

    /// Set the next block number. Anything past 65535 rolls over to 0.
    pub(crate) fn set_next_block(&mut self, block: u32) {
        self.next_block = match u16::try_from(block) {
            Ok(block) => block,
            Err(_) => {
                tracing::debug!("Block number rollover to 0 again");
                0
            }
        };
    }

    pub(crate) fn advance_block(&mut self) {
        self.set_next_block(u32::from(self.next_block) + 1);
    }

    /// True when nothing has been heard from the peer for longer than the timeout
    pub(crate) fn check_timeout(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_update) > self.config.timeout
    }

    /// Where packets for the peer go: its TID once pinned, the request port before
    pub(crate) fn peer(&self) -> SocketAddr {
        SocketAddr::new(self.remote.ip(), self.tid.unwrap_or(self.remote.port()))
    }

    /// Pin the peer's transfer ID if it is not pinned yet
    pub(crate) fn pin_tid(&mut self, port: u16) {
        if self.tid.is_none() {
            tracing::debug!("Set remote TID to {}", port);
            self.tid = Some(port);
        }
    }

    /// Send a packet and remember it for resends
    pub(crate) async fn send(&mut self, packet: Packet) -> Result<(), TransferError> {
        self.send_untracked(&packet).await?;
        self.last_packet_sent = Some(packet);
        Ok(())
    }

    /// Send a packet without replacing the resend candidate
    pub(crate) async fn send_untracked(&mut self, packet: &Packet) -> Result<(), TransferError> {
        tracing::debug!("Sending {} to {}", packet, self.peer());
        self.socket.send_to(&packet.encode(), self.peer()).await?;
        Ok(())
    }

    /// Send the next DATA block; returns whether it was the final, short one
    pub(crate) async fn send_data(&mut self) -> Result<bool, TransferError> {
        let block_size = self.block_size();
        let payload = self.stream.read_block(block_size).await?;
        let finished = payload.len() < block_size;
        self.metrics.bytes += payload.len() as u64;

        let block = self.next_block;
        self.send(Packet::Data { block, payload }).await?;
        Ok(finished)
    }

    pub(crate) async fn send_ack(&mut self, block: u16) -> Result<(), TransferError> {
        self.send(Packet::Ack { block }).await
    }

    /// Count a duplicate for `block`, failing once the cap is passed
    pub(crate) fn record_duplicate(&mut self, block: u16) -> Result<(), TransferError> {
        self.metrics.add_duplicate(block);
        if self.metrics.duplicate_limit_exceeded(block) {
            return Err(TransferError::TooManyDuplicates { block });
        }
        Ok(())
    }

    /// Wait for one datagram and feed it to the state machine
    pub(crate) async fn cycle(&mut self) -> Result<Cycle, TransferError> {
        let (len, from) = match timeout(self.config.timeout, self.socket.recv_from(&mut self.recv_buf)).await {
            Ok(received) => received?,
            Err(_) => {
                tracing::debug!("Timed out waiting for {}", self.peer());
                return Ok(Cycle::TimedOut);
            }
        };

        if from.ip() != self.remote.ip() {
            tracing::warn!(
                "Received traffic from {}, expected host {}. Discarding",
                from,
                self.remote.ip()
            );
            self.metrics.discarded += 1;
            return Ok(Cycle::Discarded);
        }

        if let Some(tid) = self.tid
            && tid != from.port()
        {
            tracing::warn!(
                "Received traffic from {} but we're connected to {}. Discarding",
                from,
                self.peer()
            );
            self.metrics.discarded += 1;
            return Ok(Cycle::Discarded);
        }

        self.last_update = Instant::now();

        let packet = match Packet::decode(&self.recv_buf[..len]) {
            Ok(packet) => packet,
            Err(e) if self.tid.is_none() => {
                tracing::debug!("Ignoring undecodable datagram from {}: {}", from, e);
                self.metrics.discarded += 1;
                return Ok(Cycle::Discarded);
            }
            Err(e) => return Err(e.into()),
        };

        self.dispatch(packet, from).await?;
        Ok(Cycle::Processed)
    }

    /// Run one packet through the hook and the state machine
    async fn dispatch(&mut self, packet: Packet, from: SocketAddr) -> Result<(), TransferError> {
        tracing::debug!("Received {} from {}", packet, from);
        if let Some(hook) = &self.hook {
            hook(&packet);
        }

        self.state = self.handle(packet, from).await?;
        self.retry_count = 0;
        Ok(())
    }

    /// Resend the last packet, or give up once the retry budget is spent
    async fn retry(&mut self) -> Result<(), TransferError> {
        if self.retry_count >= self.config.max_retries {
            return Err(TransferError::Timeout {
                retries: self.retry_count,
            });
        }
        self.retry_count += 1;
        tracing::warn!(
            "Timeout waiting for {}, resending (retry {} of {})",
            self.peer(),
            self.retry_count,
            self.config.max_retries
        );
        self.resend_last().await
    }

    async fn resend_last(&mut self) -> Result<(), TransferError> {
        let Some(packet) = self.last_packet_sent.take() else {
            return Ok(());
        };

        let bytes = packet.encode();
        self.metrics.resent_bytes += bytes.len() as u64;
        let result = self.record_duplicate(packet.block_number());
        self.last_packet_sent = Some(packet);
        result?;

        self.socket.send_to(&bytes, self.peer()).await?;
        self.last_update = Instant::now();
        Ok(())
    }

    /// Drive the session to a terminal state, then release it
    ///
    /// The context is consumed: its socket and stream are dropped on every
    /// path out of here.
    pub(crate) async fn run(mut self, opening: Opening) -> Result<SessionMetrics, TransferFailure> {
        let outcome = self.drive(opening).await;
        self.conclude(outcome).await
    }

    async fn drive(&mut self, opening: Opening) -> Result<(), TransferError> {
        match opening {
            Opening::Send(request) => {
                self.send(request).await?;
                self.state = SessionState::SentRequest;
            }
            Opening::Receive(request, from) => self.dispatch(request, from).await?,
        }

        while !self.state.is_terminal() {
            match self.cycle().await? {
                Cycle::Processed => {}
                Cycle::Discarded => {
                    if self.check_timeout(Instant::now()) {
                        self.retry().await?;
                    }
                }
                Cycle::TimedOut => self.retry().await?,
            }
        }

        Ok(())
    }

    async fn conclude(mut self, outcome: Result<(), TransferError>) -> Result<SessionMetrics, TransferFailure> {
        let outcome = match outcome {
            Ok(()) => self.stream.close().await.map_err(TransferError::from),
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            self.notify_peer(e).await;
            // Drop whatever was written so far without flushing
            self.stream = TransferStream::Closed;
        }

        self.metrics.finish();
        let metrics = self.metrics.clone();

        match outcome {
            Ok(()) => {
                self.state = SessionState::Done;
                tracing::debug!("Transfer complete: {}", metrics);
                Ok(metrics)
            }
            Err(error) => {
                self.state = SessionState::Failed(error.to_string());
                Err(TransferFailure { error, metrics })
            }
        }
    }

    /// Tell the peer why we are giving up, if the error warrants it
    async fn notify_peer(&mut self, error: &TransferError) {
        let Some((code, message)) = error.peer_notice() else {
            return;
        };
        let packet = Packet::error_with_message(code, message);
        if let Err(e) = self.send_untracked(&packet).await {
            tracing::debug!("Could not send {} to {}: {}", packet, self.peer(), e);
        }
    }
}

/// Create an ephemeral UDP socket appropriate for the peer's address family
pub(crate) async fn create_ephemeral_socket(
    peer: SocketAddr,
    local_bind: Option<IpAddr>,
) -> std::io::Result<UdpSocket> {
    let bind_addr = match local_bind {
        Some(ip) => SocketAddr::new(ip, 0),
        None => match peer {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        },
    };

    let sock = UdpSocket::bind(bind_addr).await?;
    tracing::debug!("Transfer socket bound to {}", sock.local_addr()?);
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::error::DecodeError;
    use crate::stream::{Sink, Source};

    async fn loopback_context(role: Role) -> (TransferContext, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = TransferConfig {
            timeout: Duration::from_millis(50),
            max_retries: 2,
            local_bind: None,
        };
        let ctx = TransferContext::client(
            role,
            socket,
            peer.local_addr().unwrap(),
            TransferStream::source(Source::from_bytes(vec![1u8; 1000])),
            TftpOptions::new(),
            config,
            None,
        );
        (ctx, peer)
    }

    #[test]
    fn test_transfer_config_default() {
        let config = TransferConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(TIMEOUT_SECS));
        assert_eq!(config.max_retries, MAX_RETRIES);
        assert!(config.local_bind.is_none());
    }

    #[tokio::test]
    async fn test_next_block_wraps_to_zero() {
        let (mut ctx, _peer) = loopback_context(Role::ClientDownload).await;

        ctx.set_next_block(65535);
        ctx.advance_block();
        assert_eq!(ctx.next_block(), 0, "65535 + 1 must wrap to 0, not 1");

        ctx.advance_block();
        assert_eq!(ctx.next_block(), 1);

        ctx.set_next_block(65536);
        assert_eq!(ctx.next_block(), 0);
        ctx.set_next_block(70000);
        assert_eq!(ctx.next_block(), 0);
    }

    #[tokio::test]
    async fn test_block_size_defaults_to_512() {
        let (ctx, _peer) = loopback_context(Role::ClientUpload).await;
        assert_eq!(ctx.block_size(), 512);
        assert_eq!(ctx.state, SessionState::SentRequest);
    }

    #[tokio::test]
    async fn test_check_timeout() {
        let (ctx, _peer) = loopback_context(Role::ClientDownload).await;
        let now = Instant::now();
        assert!(!ctx.check_timeout(now));
        assert!(ctx.check_timeout(now + Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_cycle_discards_foreign_port_once_pinned() {
        let (mut ctx, peer) = loopback_context(Role::ClientDownload).await;
        ctx.pin_tid(peer.local_addr().unwrap().port());
        ctx.state = SessionState::ExpectData;
        ctx.set_next_block(1);

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let data = Packet::Data {
            block: 1,
            payload: b"x".to_vec(),
        };
        stranger.send_to(&data.encode(), ctx.socket.local_addr().unwrap()).await.unwrap();

        assert_eq!(ctx.cycle().await.unwrap(), Cycle::Discarded);
        assert_eq!(ctx.state, SessionState::ExpectData);
        assert_eq!(ctx.next_block(), 1);
        assert_eq!(ctx.metrics.discarded, 1);
    }

    #[tokio::test]
    async fn test_malformed_datagram_from_pinned_peer_is_fatal() {
        let (mut ctx, peer) = loopback_context(Role::ClientDownload).await;
        let local = ctx.socket.local_addr().unwrap();

        // Before pinning, garbage is dropped
        peer.send_to(&[0, 9, 1], local).await.unwrap();
        assert_eq!(ctx.cycle().await.unwrap(), Cycle::Discarded);

        ctx.pin_tid(peer.local_addr().unwrap().port());
        ctx.state = SessionState::ExpectData;
        ctx.set_next_block(1);

        peer.send_to(&[0, 9, 1], local).await.unwrap();
        let err = ctx.cycle().await.unwrap_err();
        assert!(matches!(err, TransferError::Decode(DecodeError::UnknownOpcode(9))));
        assert!(err.peer_notice().is_none());
    }

    #[tokio::test]
    async fn test_cycle_reuses_receive_buffer() {
        let (mut ctx, peer) = loopback_context(Role::ClientDownload).await;
        let local = ctx.socket.local_addr().unwrap();
        ctx.stream = TransferStream::sink(Sink::writer(Vec::new()));
        ctx.pin_tid(peer.local_addr().unwrap().port());
        ctx.state = SessionState::ExpectData;
        ctx.set_next_block(1);

        let full = Packet::Data {
            block: 1,
            payload: vec![7u8; 512],
        };
        let short = Packet::Data {
            block: 2,
            payload: vec![8u8; 3],
        };
        peer.send_to(&full.encode(), local).await.unwrap();
        assert_eq!(ctx.cycle().await.unwrap(), Cycle::Processed);
        peer.send_to(&short.encode(), local).await.unwrap();
        assert_eq!(ctx.cycle().await.unwrap(), Cycle::Processed);

        // The short datagram is not padded with leftovers of the long one
        assert_eq!(ctx.state, SessionState::Done);
        assert_eq!(ctx.metrics.bytes, 515);
        assert_eq!(ctx.recv_buf.len(), RECV_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_server_session_counts_uploaded_bytes() {
        let root = tempdir().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let settings = Arc::new(ServeSettings {
            root: root.path().to_path_buf(),
            resolver: None,
            report_transfer_size: false,
        });
        let config = TransferConfig {
            timeout: Duration::from_millis(500),
            ..Default::default()
        };

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ctx = TransferContext::server(socket, client_addr, settings, config);
        let request = Packet::WriteRequest {
            filename: "upload.bin".to_string(),
            mode: "octet".to_string(),
            options: TftpOptions::new(),
        };
        let session = tokio::spawn(ctx.run(Opening::Receive(request, client_addr)));

        let content: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let mut buf = [0u8; 64];
        let (len, server) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack { block: 0 });

        for (block, chunk) in (1u16..).zip(content.chunks(512)) {
            let data = Packet::Data {
                block,
                payload: chunk.to_vec(),
            };
            client.send_to(&data.encode(), server).await.unwrap();
            let (len, _) = client.recv_from(&mut buf).await.unwrap();
            assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack { block });
        }

        let metrics = session.await.unwrap().unwrap();
        assert_eq!(metrics.bytes, 600);
        assert_eq!(metrics.duplicate_total(), 0);
        assert_eq!(tokio::fs::read(root.path().join("upload.bin")).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_cycle_times_out() {
        let (mut ctx, _peer) = loopback_context(Role::ClientDownload).await;
        assert_eq!(ctx.cycle().await.unwrap(), Cycle::TimedOut);
    }

    #[tokio::test]
    async fn test_retry_resends_then_gives_up() {
        let (mut ctx, peer) = loopback_context(Role::ClientDownload).await;
        ctx.send(Packet::read_request("a.txt", TftpOptions::new())).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let original = buf[..len].to_vec();

        ctx.retry().await.unwrap();
        ctx.retry().await.unwrap();
        for _ in 0..2 {
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], original.as_slice());
        }

        assert_eq!(ctx.retry_count, 2);
        assert_eq!(ctx.metrics.resent_bytes, 2 * original.len() as u64);
        assert_eq!(ctx.metrics.duplicates.get(&0), Some(&2));

        let err = ctx.retry().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_ephemeral_socket_family() {
        let v4 = create_ephemeral_socket("127.0.0.1:69".parse().unwrap(), None).await.unwrap();
        assert!(v4.local_addr().unwrap().is_ipv4());
        assert_ne!(v4.local_addr().unwrap().port(), 0);

        let bound = create_ephemeral_socket("10.0.0.1:69".parse().unwrap(), Some("127.0.0.1".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(bound.local_addr().unwrap().ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
