//! Error types for the TFTP engine.

use std::io;

use thiserror::Error;

use crate::metrics::SessionMetrics;
use crate::protocol::TftpErrorCode;

/// A datagram that is not a well-formed TFTP packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{kind} too short ({len} bytes)")]
    TooShort { kind: &'static str, len: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("request is missing its {0}")]
    MissingField(&'static str),
    #[error("string field is not null-terminated")]
    Unterminated,
    #[error("{0} is not valid UTF-8")]
    InvalidString(&'static str),
    #[error("option section has an odd number of fields ({0})")]
    OddOptionFields(usize),
}

/// Fatal conditions that end a transfer session.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Malformed datagram from the pinned peer
    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),
    /// Packet not legal for the current state, or a rejected request
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The peer's OACK does not satisfy what was requested
    #[error("option negotiation failed: {0}")]
    Negotiation(String),
    /// The peer sent an ERROR packet
    #[error("peer reported error {code}: {message}")]
    PeerReported { code: u16, message: String },
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("too many duplicates for block {block}")]
    TooManyDuplicates { block: u16 },
    #[error("timed out after {retries} retries")]
    Timeout { retries: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    pub(crate) fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub(crate) fn negotiation(message: impl Into<String>) -> Self {
        Self::Negotiation(message.into())
    }

    /// Error code and message to send to the peer before terminating, if any
    ///
    /// Errors the peer caused by reporting, or that leave nothing useful to
    /// say (timeouts, garbage), are not answered.
    pub fn peer_notice(&self) -> Option<(TftpErrorCode, String)> {
        match self {
            Self::ProtocolViolation(message) => Some((TftpErrorCode::IllegalOperation, message.clone())),
            Self::Negotiation(message) => Some((TftpErrorCode::OptionNegotiationFailed, message.clone())),
            Self::FileNotFound(_) => Some((
                TftpErrorCode::FileNotFound,
                TftpErrorCode::FileNotFound.default_message().to_string(),
            )),
            Self::Io(e) => {
                let code = match e.kind() {
                    io::ErrorKind::PermissionDenied => TftpErrorCode::AccessViolation,
                    io::ErrorKind::StorageFull => TftpErrorCode::DiskFull,
                    io::ErrorKind::AlreadyExists => TftpErrorCode::FileAlreadyExists,
                    _ => TftpErrorCode::NotDefined,
                };
                let message = match code {
                    TftpErrorCode::NotDefined => e.to_string(),
                    other => other.default_message().to_string(),
                };
                Some((code, message))
            }
            Self::Decode(_) | Self::PeerReported { .. } | Self::TooManyDuplicates { .. } | Self::Timeout { .. } => None,
        }
    }

    /// Whether this failure came from the retry budget running out
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A failed transfer together with the metrics gathered before it failed.
#[derive(Error, Debug)]
#[error("transfer failed")]
pub struct TransferFailure {
    #[source]
    pub error: TransferError,
    pub metrics: SessionMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_notice_mapping() {
        let (code, message) = TransferError::violation("There is no block zero!").peer_notice().unwrap();
        assert_eq!(code, TftpErrorCode::IllegalOperation);
        assert_eq!(message, "There is no block zero!");

        let (code, _) = TransferError::negotiation("blksize out of range").peer_notice().unwrap();
        assert_eq!(code, TftpErrorCode::OptionNegotiationFailed);

        let (code, message) = TransferError::FileNotFound("missing.txt".into()).peer_notice().unwrap();
        assert_eq!(code, TftpErrorCode::FileNotFound);
        assert_eq!(message, "File not found");

        let denied = TransferError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.peer_notice().unwrap().0, TftpErrorCode::AccessViolation);

        let other = TransferError::Io(io::Error::other("boom"));
        assert_eq!(other.peer_notice(), Some((TftpErrorCode::NotDefined, "boom".to_string())));

        assert!(TransferError::Timeout { retries: 3 }.peer_notice().is_none());
        assert!(
            TransferError::PeerReported {
                code: 1,
                message: "File not found".into()
            }
            .peer_notice()
            .is_none()
        );
    }
}
