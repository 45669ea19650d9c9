//! TFTP Session State Machine
//!
//! Every inbound packet is handled by [`TransferContext::handle`], which
//! matches on the current [`SessionState`] and the packet kind and returns
//! the next state. Side effects (sending, writing, reading the next block)
//! happen through the context while the transition runs.
//!
//! | State | Packet | Next |
//! |---|---|---|
//! | any | ERROR | fatal, peer's error surfaced |
//! | `Idle` (server) | RRQ | `ServerNegotiating` (OACK sent) or `ExpectAck` |
//! | `Idle` (server) | WRQ | `ExpectData` |
//! | `SentRequest` (download) | OACK / DATA | `ExpectData` or `Done` |
//! | `SentRequest` (upload) | OACK / ACK 0 | `ExpectAck` |
//! | `ExpectData` | DATA | `ExpectData` or `Done` |
//! | `ExpectAck` | ACK | `ExpectAck` or `Done` |
//! | `ServerNegotiating` | ACK 0 | `ExpectAck` |
//!
//! Anything not listed is an illegal operation.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::fs::File;

use crate::error::TransferError;
use crate::protocol::{BlockSize, Packet, TftpOptions, TransferMode};
use crate::stream::{Sink, Source, TransferStream};
use crate::transfer::{OptionSet, Role, ServeSettings, TransferContext};

/// Value echoed for `tsize` unless real sizes are reported
///
/// This does not describe the file; it only acknowledges that the option
/// was seen.
pub const TSIZE_PLACEHOLDER: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Server session waiting for the initial request
    Idle,
    /// Client sent RRQ or WRQ and waits for the first reply
    SentRequest,
    /// Sent a DATA block, waiting for its ACK
    ExpectAck,
    /// Waiting for the next DATA block
    ExpectData,
    /// Server sent an OACK for a read request, waiting for ACK 0
    ServerNegotiating,
    Done,
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::SentRequest => f.write_str("SentRequest"),
            Self::ExpectAck => f.write_str("ExpectAck"),
            Self::ExpectData => f.write_str("ExpectData"),
            Self::ServerNegotiating => f.write_str("ServerNegotiating"),
            Self::Done => f.write_str("Done"),
            Self::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

fn unexpected(packet: &Packet, state: &SessionState) -> TransferError {
    TransferError::violation(format!("Received {} while in state {}", packet.opcode(), state))
}

impl TransferContext {
    /// Apply one inbound packet and return the next state
    pub(crate) async fn handle(&mut self, packet: Packet, from: SocketAddr) -> Result<SessionState, TransferError> {
        if let Packet::Error { code, message } = packet {
            tracing::warn!("Peer {} reported error {}: {}", from, code, message);
            return Err(TransferError::PeerReported { code, message });
        }

        let state = self.state.clone();
        match state {
            SessionState::Idle => self.server_start(packet, from).await,
            SessionState::SentRequest => match self.role {
                Role::ClientDownload => self.sent_read_request(packet, from).await,
                Role::ClientUpload => self.sent_write_request(packet, from).await,
                Role::Server => Err(unexpected(&packet, &state)),
            },
            SessionState::ExpectData => match packet {
                Packet::Data { block, payload } => self.handle_data(block, payload).await,
                other => Err(unexpected(&other, &state)),
            },
            SessionState::ExpectAck | SessionState::ServerNegotiating => match packet {
                Packet::Ack { block } => self.handle_ack(block).await,
                other => Err(unexpected(&other, &state)),
            },
            SessionState::Done | SessionState::Failed(_) => Err(unexpected(&packet, &state)),
        }
    }

    /// Client download: first reply to our RRQ
    async fn sent_read_request(&mut self, packet: Packet, from: SocketAddr) -> Result<SessionState, TransferError> {
        self.pin_tid(from.port());

        match packet {
            Packet::OptionAck { options } => {
                self.accept_option_ack(&options)?;
                self.send_ack(0).await?;
                self.set_next_block(1);
                Ok(SessionState::ExpectData)
            }
            Packet::Data { block, payload } => {
                if !self.requested.is_empty() {
                    tracing::warn!("Server ignored options, falling back to defaults");
                }
                self.options = OptionSet::default();
                self.set_next_block(1);
                self.handle_data(block, payload).await
            }
            Packet::Ack { .. } => Err(TransferError::violation("Received ACK from peer while in download")),
            other => Err(unexpected(&other, &SessionState::SentRequest)),
        }
    }

    /// Client upload: first reply to our WRQ
    async fn sent_write_request(&mut self, packet: Packet, from: SocketAddr) -> Result<SessionState, TransferError> {
        self.pin_tid(from.port());

        match packet {
            Packet::OptionAck { options } => {
                self.accept_option_ack(&options)?;
                self.start_sending().await
            }
            Packet::Ack { block: 0 } => {
                if !self.requested.is_empty() {
                    tracing::warn!("Server ignored options, falling back to defaults");
                }
                self.options = OptionSet::default();
                self.start_sending().await
            }
            Packet::Ack { block } => {
                tracing::warn!("Discarding ACK to block {} while waiting for ACK 0", block);
                Ok(SessionState::SentRequest)
            }
            other => Err(unexpected(&other, &SessionState::SentRequest)),
        }
    }

    async fn start_sending(&mut self) -> Result<SessionState, TransferError> {
        self.set_next_block(1);
        self.pending_complete = self.send_data().await?;
        Ok(SessionState::ExpectAck)
    }

    /// Check an OACK against the options we asked for and adopt it
    fn accept_option_ack(&mut self, offered: &TftpOptions) -> Result<(), TransferError> {
        if offered.is_empty() {
            return Err(TransferError::negotiation("No options found in OACK"));
        }

        let mut negotiated = OptionSet::default();
        for (name, value) in offered.iter() {
            if !self.requested.contains(name) {
                return Err(TransferError::negotiation(format!(
                    "Peer returned option '{}' that was not requested",
                    name
                )));
            }

            if name.eq_ignore_ascii_case("blksize") {
                negotiated.blksize = BlockSize::parse(value)
                    .ok_or_else(|| TransferError::negotiation(format!("blksize {} is out of range", value)))?;
            } else if name.eq_ignore_ascii_case("tsize") {
                let size = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| TransferError::negotiation(format!("Invalid tsize '{}'", value)))?;
                negotiated.tsize = Some(size);
            } else {
                return Err(TransferError::negotiation(format!("Unsupported option '{}'", name)));
            }
        }

        tracing::info!(
            "Negotiated blksize {}{}",
            negotiated.blksize,
            negotiated.tsize.map(|n| format!(", tsize {}", n)).unwrap_or_default()
        );
        self.options = negotiated;
        Ok(())
    }

    async fn handle_data(&mut self, block: u16, payload: Vec<u8>) -> Result<SessionState, TransferError> {
        let next_block = self.next_block();

        if block == next_block {
            self.stream.write_block(&payload).await?;
            self.metrics.bytes += payload.len() as u64;
            self.send_ack(block).await?;
            self.advance_block();

            if payload.len() < self.block_size() {
                tracing::info!("End of file detected");
                return Ok(SessionState::Done);
            }
            Ok(SessionState::ExpectData)
        } else if block < next_block {
            if block == 0 {
                return Err(TransferError::violation("There is no block zero!"));
            }
            tracing::warn!("Dropping duplicate block {}", block);
            self.record_duplicate(block)?;
            self.send_untracked(&Packet::Ack { block }).await?;
            Ok(SessionState::ExpectData)
        } else {
            Err(TransferError::violation(format!(
                "Received future block {} while expecting {}",
                block, next_block
            )))
        }
    }

    async fn handle_ack(&mut self, block: u16) -> Result<SessionState, TransferError> {
        let next_block = self.next_block();

        if block == next_block {
            if self.pending_complete {
                tracing::info!("Received ACK to final DATA, we're done");
                return Ok(SessionState::Done);
            }
            self.advance_block();
            self.pending_complete = self.send_data().await?;
            Ok(SessionState::ExpectAck)
        } else if block < next_block {
            tracing::warn!("Received duplicate ACK for block {}", block);
            self.record_duplicate(block)?;
            Ok(SessionState::ExpectAck)
        } else {
            Err(TransferError::violation(format!(
                "Received ACK for block {} we have not sent yet (at {})",
                block, next_block
            )))
        }
    }

    /// Server: dispatch the request that opened this session
    async fn server_start(&mut self, packet: Packet, from: SocketAddr) -> Result<SessionState, TransferError> {
        match packet {
            Packet::ReadRequest {
                filename,
                mode,
                options,
            } => self.server_recv_read(filename, mode, options, from).await,
            Packet::WriteRequest {
                filename,
                mode,
                options,
            } => self.server_recv_write(filename, mode, options, from).await,
            other => Err(TransferError::violation(format!(
                "Expected RRQ or WRQ to start a transfer, got {}",
                other.opcode()
            ))),
        }
    }

    async fn server_recv_read(
        &mut self,
        filename: String,
        mode: String,
        options: TftpOptions,
        from: SocketAddr,
    ) -> Result<SessionState, TransferError> {
        self.pin_tid(from.port());
        check_request(&filename, &mode)?;
        let settings = self.settings()?;

        let (source, size) = open_for_read(&settings, &filename).await?;
        self.stream = TransferStream::source(source);

        let tsize_reply = if settings.report_transfer_size { size } else { None };
        let accepted = self.accept_request_options(&options, tsize_reply);

        if accepted.is_empty() {
            self.set_next_block(1);
            self.pending_complete = self.send_data().await?;
            Ok(SessionState::ExpectAck)
        } else {
            self.send(Packet::OptionAck { options: accepted }).await?;
            self.set_next_block(0);
            self.pending_complete = false;
            Ok(SessionState::ServerNegotiating)
        }
    }

    async fn server_recv_write(
        &mut self,
        filename: String,
        mode: String,
        options: TftpOptions,
        from: SocketAddr,
    ) -> Result<SessionState, TransferError> {
        self.pin_tid(from.port());
        check_request(&filename, &mode)?;
        let settings = self.settings()?;

        let file = File::create(settings.root.join(&filename)).await?;
        self.stream = TransferStream::sink(Sink::writer(file));

        let tsize_reply = if settings.report_transfer_size {
            options.get("tsize").and_then(|v| v.trim().parse().ok())
        } else {
            None
        };
        let accepted = self.accept_request_options(&options, tsize_reply);

        if accepted.is_empty() {
            self.send_ack(0).await?;
        } else {
            self.send(Packet::OptionAck { options: accepted }).await?;
        }
        self.set_next_block(1);
        Ok(SessionState::ExpectData)
    }

    fn accept_request_options(&mut self, requested: &TftpOptions, tsize_reply: Option<u64>) -> TftpOptions {
        let (negotiated, accepted) = negotiate_request(requested, tsize_reply);
        self.options = negotiated;
        accepted
    }

    fn settings(&self) -> Result<Arc<ServeSettings>, TransferError> {
        self.serve
            .clone()
            .ok_or_else(|| TransferError::violation("Session is not serving files"))
    }
}

/// Filter a request's options down to what the server supports
///
/// `blksize` is clamped into range, `tsize` is answered with `tsize_reply`
/// or the placeholder, everything else is dropped. Returns the options in
/// force and the options to put in the OACK, in request order.
pub(crate) fn negotiate_request(requested: &TftpOptions, tsize_reply: Option<u64>) -> (OptionSet, TftpOptions) {
    let mut negotiated = OptionSet::default();
    let mut accepted = TftpOptions::new();

    for (name, value) in requested.iter() {
        if name.eq_ignore_ascii_case("blksize") {
            match value.trim().parse::<u64>() {
                Ok(size) => {
                    let blksize = BlockSize::clamped(size);
                    if blksize.get() as u64 != size {
                        tracing::debug!("Clamped requested blksize {} to {}", size, blksize);
                    }
                    negotiated.blksize = blksize;
                    accepted.insert("blksize", blksize.to_string());
                }
                Err(_) => tracing::warn!("Dropping malformed blksize '{}'", value),
            }
        } else if name.eq_ignore_ascii_case("tsize") {
            let reply = tsize_reply
                .map(|n| n.to_string())
                .unwrap_or_else(|| TSIZE_PLACEHOLDER.to_string());
            negotiated.tsize = reply.parse().ok();
            accepted.insert("tsize", reply);
        } else {
            tracing::debug!("Dropping unsupported option '{}'", name);
        }
    }

    (negotiated, accepted)
}

/// Reject non-octet modes and filenames that could leave the root directory
fn check_request(filename: &str, mode: &str) -> Result<(), TransferError> {
    match TransferMode::from_str_opt(mode) {
        Some(mode) if mode.is_supported() => {}
        _ => {
            return Err(TransferError::violation(format!(
                "Only octet transfers are supported, got '{}'",
                mode
            )));
        }
    }

    if filename.is_empty() || filename == "." || filename == ".." || filename.contains(['/', '\\']) {
        return Err(TransferError::violation(format!("Illegal filename '{}'", filename)));
    }

    Ok(())
}

/// Open `filename` under the root, falling back to the dynamic resolver
///
/// Also returns the file size when it is known.
async fn open_for_read(settings: &ServeSettings, filename: &str) -> Result<(Source, Option<u64>), TransferError> {
    let path = settings.root.join(filename);

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {
            let file = File::open(&path).await?;
            return Ok((Source::reader(file), Some(meta.len())));
        }
        Ok(_) => tracing::debug!("{} is not a regular file", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(resolver) = &settings.resolver
        && let Some(source) = resolver.resolve(filename)
    {
        tracing::info!("Serving '{}' from the dynamic file resolver", filename);
        return Ok((source, None));
    }

    Err(TransferError::FileNotFound(filename.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::transfer::TransferConfig;

    fn options(pairs: &[(&str, &str)]) -> TftpOptions {
        pairs.iter().copied().collect()
    }

    async fn download_context(requested: TftpOptions) -> (TransferContext, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ctx = TransferContext::client(
            Role::ClientDownload,
            socket,
            peer.local_addr().unwrap(),
            TransferStream::sink(Sink::writer(Vec::new())),
            requested,
            TransferConfig {
                timeout: Duration::from_millis(100),
                ..Default::default()
            },
            None,
        );
        (ctx, peer)
    }

    /// Upload context waiting for the ACK of `next_block`
    async fn upload_context(next_block: u16) -> (TransferContext, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut ctx = TransferContext::client(
            Role::ClientUpload,
            socket,
            peer.local_addr().unwrap(),
            TransferStream::source(Source::from_bytes(vec![5u8; 4096])),
            TftpOptions::new(),
            TransferConfig {
                timeout: Duration::from_millis(100),
                ..Default::default()
            },
            None,
        );
        ctx.pin_tid(peer.local_addr().unwrap().port());
        ctx.state = SessionState::ExpectAck;
        ctx.set_next_block(u32::from(next_block));
        (ctx, peer)
    }

    async fn recv_packet(peer: &UdpSocket) -> Packet {
        let mut buf = vec![0u8; 2048];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        Packet::decode(&buf[..len]).unwrap()
    }

    #[test]
    fn test_negotiate_clamps_blksize() {
        let (set, accepted) = negotiate_request(&options(&[("blksize", "100000")]), None);
        assert_eq!(set.blksize.get(), 65464);
        assert_eq!(accepted.get("blksize"), Some("65464"));

        let (set, accepted) = negotiate_request(&options(&[("blksize", "4")]), None);
        assert_eq!(set.blksize.get(), 8);
        assert_eq!(accepted.get("blksize"), Some("8"));

        let (set, _) = negotiate_request(&options(&[("blksize", "1428")]), None);
        assert_eq!(set.blksize.get(), 1428);
    }

    #[test]
    fn test_negotiate_filters_unsupported() {
        let requested = options(&[("timeout", "5"), ("tsize", "0"), ("blksize", "1024"), ("windowsize", "4")]);
        let (set, accepted) = negotiate_request(&requested, None);

        assert_eq!(accepted.names().collect::<Vec<_>>(), ["tsize", "blksize"]);
        assert_eq!(accepted.get("tsize"), Some(TSIZE_PLACEHOLDER));
        assert_eq!(set.tsize, Some(1));

        let (_, accepted) = negotiate_request(&options(&[("timeout", "5")]), None);
        assert!(accepted.is_empty());

        let (set, accepted) = negotiate_request(&options(&[("blksize", "big")]), None);
        assert!(accepted.is_empty());
        assert_eq!(set.blksize.get(), BlockSize::DEFAULT);
    }

    #[test]
    fn test_negotiate_reports_real_tsize() {
        let (set, accepted) = negotiate_request(&options(&[("tsize", "0")]), Some(600));
        assert_eq!(accepted.get("tsize"), Some("600"));
        assert_eq!(set.tsize, Some(600));
    }

    #[test]
    fn test_check_request() {
        assert!(check_request("hello.txt", "octet").is_ok());
        assert!(check_request("hello.txt", "netascii").is_err());
        assert!(check_request("hello.txt", "mail").is_err());
        assert!(check_request("../etc/passwd", "octet").is_err());
        assert!(check_request("dir\\file", "octet").is_err());
        assert!(check_request("..", "octet").is_err());
        assert!(check_request("", "octet").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Done.is_terminal());
        assert!(SessionState::Failed("x".into()).is_terminal());
        assert!(!SessionState::ExpectAck.is_terminal());
        assert_eq!(SessionState::ServerNegotiating.to_string(), "ServerNegotiating");
    }

    #[tokio::test]
    async fn test_oack_accepted_when_in_range() {
        let (mut ctx, peer) = download_context(options(&[("blksize", "100000")])).await;
        let from = peer.local_addr().unwrap();

        let next = ctx
            .handle(
                Packet::OptionAck {
                    options: options(&[("blksize", "65464")]),
                },
                from,
            )
            .await
            .unwrap();

        assert_eq!(next, SessionState::ExpectData);
        assert_eq!(ctx.block_size(), 65464);
        assert_eq!(ctx.next_block(), 1);
        assert_eq!(recv_packet(&peer).await, Packet::Ack { block: 0 });
    }

    #[tokio::test]
    async fn test_oack_with_unrequested_option_fails() {
        let (mut ctx, peer) = download_context(options(&[("blksize", "1024")])).await;
        let err = ctx
            .handle(
                Packet::OptionAck {
                    options: options(&[("tsize", "10")]),
                },
                peer.local_addr().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Negotiation(_)));
    }

    #[tokio::test]
    async fn test_oack_rejects_out_of_range_and_unknown() {
        let (mut ctx, peer) = download_context(options(&[("blksize", "1024"), ("timeout", "3")])).await;
        let from = peer.local_addr().unwrap();

        let err = ctx
            .handle(
                Packet::OptionAck {
                    options: options(&[("blksize", "70000")]),
                },
                from,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Negotiation(_)));

        let err = ctx
            .handle(
                Packet::OptionAck {
                    options: options(&[("timeout", "3")]),
                },
                from,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Negotiation(_)));

        let err = ctx
            .handle(Packet::OptionAck { options: options(&[]) }, from)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Negotiation(_)));
    }

    #[tokio::test]
    async fn test_data_without_oack_resets_options() {
        let (mut ctx, peer) = download_context(options(&[("blksize", "1024")])).await;
        let next = ctx
            .handle(
                Packet::Data {
                    block: 1,
                    payload: vec![0u8; 512],
                },
                peer.local_addr().unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(next, SessionState::ExpectData);
        assert_eq!(ctx.block_size(), 512);
        assert_eq!(ctx.next_block(), 2);
        assert_eq!(ctx.metrics.bytes, 512);
    }

    #[tokio::test]
    async fn test_duplicate_and_future_blocks() {
        let (mut ctx, peer) = download_context(TftpOptions::new()).await;
        let from = peer.local_addr().unwrap();
        ctx.state = SessionState::ExpectData;
        ctx.set_next_block(3);

        let next = ctx
            .handle(
                Packet::Data {
                    block: 2,
                    payload: vec![1u8; 512],
                },
                from,
            )
            .await
            .unwrap();
        assert_eq!(next, SessionState::ExpectData);
        assert_eq!(ctx.next_block(), 3);
        assert_eq!(ctx.metrics.bytes, 0);
        assert_eq!(ctx.metrics.duplicates.get(&2), Some(&1));
        assert_eq!(recv_packet(&peer).await, Packet::Ack { block: 2 });

        let err = ctx
            .handle(
                Packet::Data {
                    block: 0,
                    payload: Vec::new(),
                },
                from,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));

        let err = ctx
            .handle(
                Packet::Data {
                    block: 4,
                    payload: Vec::new(),
                },
                from,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_wrong_packet_type_is_illegal() {
        let (mut ctx, peer) = download_context(TftpOptions::new()).await;
        let err = ctx
            .handle(Packet::Ack { block: 1 }, peer.local_addr().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));

        ctx.state = SessionState::ExpectData;
        let err = ctx
            .handle(
                Packet::read_request("x", TftpOptions::new()),
                peer.local_addr().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_peer_error_is_surfaced() {
        let (mut ctx, peer) = download_context(TftpOptions::new()).await;
        let err = ctx
            .handle(
                Packet::error_with_message(crate::TftpErrorCode::DiskFull, "no space"),
                peer.local_addr().unwrap(),
            )
            .await
            .unwrap_err();
        match err {
            TransferError::PeerReported { code, message } => {
                assert_eq!(code, 3);
                assert_eq!(message, "no space");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_counted_not_answered() {
        let (mut ctx, peer) = upload_context(3).await;
        let from = peer.local_addr().unwrap();

        let next = ctx.handle(Packet::Ack { block: 2 }, from).await.unwrap();
        assert_eq!(next, SessionState::ExpectAck);
        assert_eq!(ctx.next_block(), 3);
        assert_eq!(ctx.metrics.duplicates.get(&2), Some(&1));
        assert_eq!(ctx.metrics.bytes, 0);

        // Nothing goes out: the resend is left to the timeout
        let mut buf = [0u8; 1024];
        let quiet = tokio::time::timeout(Duration::from_millis(100), peer.recv_from(&mut buf)).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_ack_for_unsent_block_is_fatal() {
        let (mut ctx, peer) = upload_context(1).await;
        let err = ctx
            .handle(Packet::Ack { block: 5 }, peer.local_addr().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        let (code, message) = err.peer_notice().unwrap();
        assert_eq!(code, crate::TftpErrorCode::IllegalOperation);
        assert_eq!(message, "Received ACK for block 5 we have not sent yet (at 1)");
    }

    #[tokio::test]
    async fn test_negotiating_server_rejects_data_ack() {
        let (mut ctx, peer) = upload_context(0).await;
        ctx.state = SessionState::ServerNegotiating;

        let err = ctx
            .handle(Packet::Ack { block: 1 }, peer.local_addr().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert_eq!(ctx.metrics.bytes, 0);
    }

    #[tokio::test]
    async fn test_duplicate_cap_ends_session() {
        let (mut ctx, peer) = upload_context(3).await;
        let from = peer.local_addr().unwrap();

        for _ in 0..crate::metrics::MAX_DUPLICATES {
            let next = ctx.handle(Packet::Ack { block: 2 }, from).await.unwrap();
            assert_eq!(next, SessionState::ExpectAck);
        }

        let err = ctx.handle(Packet::Ack { block: 2 }, from).await.unwrap_err();
        assert!(matches!(err, TransferError::TooManyDuplicates { block: 2 }));
        assert!(err.peer_notice().is_none());
        assert_eq!(ctx.metrics.duplicates.get(&2), Some(&21));
    }
}
