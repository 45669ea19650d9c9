//! TFTP (Trivial File Transfer Protocol) Engine
//!
//! This crate provides a TFTP client and server built on one transfer state
//! machine, with support for:
//! - Read (RRQ) and write (WRQ) requests, in both directions
//! - Binary (octet) transfer mode
//! - Option negotiation (RFC 2347) with block size (RFC 2348) and transfer
//!   size (RFC 2349)
//! - Transfer ID pinning, timeouts with resends, duplicate detection
//! - Per-session metrics
//! - Concurrent server sessions with graceful shutdown
//!
//! # Protocol Organization
//!
//! - [`TftpOpcode`] - All TFTP opcodes
//! - [`TftpErrorCode`] - Standard error codes with default messages
//! - [`TransferMode`] - Transfer modes with validation
//! - [`BlockSize`] - Block size bounds from RFC 2348
//! - [`TftpOptions`] - Ordered, case-insensitive option map
//! - [`Packet`] - The packet codec
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use tftp::{serve_forever, TftpServer, TftpServerConfig};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Simple usage with convenience function
//!     serve_forever("0.0.0.0:69".to_string(), PathBuf::from("./tftp_root"), None).await?;
//!
//!     // Or use the server struct for more control
//!     let mut server = TftpServer::with_config("127.0.0.1:6969".to_string(), PathBuf::from("./files"))
//!         .with_resolver(|name: &str| (name == "hello.txt").then(|| tftp::Source::from_bytes(b"hi".to_vec())));
//!     server.run_until(async { tokio::signal::ctrl_c().await.unwrap_or_default() }).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Working with Protocol Types
//!
//! ```rust
//! use tftp::{BlockSize, Packet, TftpErrorCode, TftpOpcode, TftpOptions, TransferMode};
//!
//! // Create a read request
//! let mut options = TftpOptions::new();
//! options.insert("blksize", "1400");
//! let request = Packet::read_request("boot.img", options);
//! assert_eq!(Packet::decode(&request.encode()).unwrap(), request);
//!
//! // Work with opcodes
//! assert_eq!(TftpOpcode::ReadRequest.as_u16(), 1);
//! assert_eq!(TftpOpcode::ReadRequest.name(), "RRQ");
//!
//! // Parse transfer modes safely
//! let mode: TransferMode = "octet".parse().unwrap();
//! assert!(mode.is_supported());
//!
//! // Block size bounds
//! assert_eq!(BlockSize::parse("1024").map(BlockSize::get), Some(1024));
//! assert_eq!(BlockSize::clamped(100_000).get(), BlockSize::MAX);
//!
//! // Create error responses
//! let error = Packet::error(TftpErrorCode::FileNotFound);
//! assert_eq!(error.to_string(), "ERROR 1: File not found");
//! ```
//!
//! # Security Features
//!
//! - Only plain file names are served: no `/`, `\`, `.` or `..`
//! - Datagrams from anyone but the pinned peer are discarded
//! - Only regular files are read from the root directory

mod client;
mod error;
mod metrics;
mod protocol;
mod server;
mod state;
mod stream;
mod transfer;

pub use client::*;
pub use error::*;
pub use metrics::*;
pub use protocol::*;
pub use server::*;
pub use state::{SessionState, TSIZE_PLACEHOLDER};
pub use stream::{FileResolver, STDIO_SENTINEL, Sink, Source};
pub use transfer::{PacketHook, TransferConfig};
