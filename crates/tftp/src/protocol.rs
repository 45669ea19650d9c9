//! TFTP Protocol Implementation
//!
//! This module contains the wire-level half of the engine: opcodes, error
//! codes, transfer modes, block size bounds, the ordered option map and the
//! [`Packet`] codec.
//!
//! # TFTP Protocol Overview
//!
//! TFTP (Trivial File Transfer Protocol) is defined in RFC 1350, with option
//! negotiation added by RFC 2347 and the `blksize`/`tsize` options by RFC 2348
//! and RFC 2349. Every packet starts with a two byte big-endian opcode:
//!
//! - Read Request (RRQ) - Request to read a file from the server
//! - Write Request (WRQ) - Request to write a file to the server
//! - Data packets - Transfer file content in blocks
//! - Acknowledgment (ACK) - Confirm receipt of data blocks
//! - Error packets - Report errors during transfer
//! - Option acknowledgment (OACK) - Confirm negotiated transfer options
//!
//! Encoding is bit-exact: `Packet::decode(&packet.encode())` yields the same
//! packet for every well-formed value.

use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 | \[Options\] |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 | \[Options\] |
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries up to `blksize` bytes. A payload shorter than the negotiated
    /// block size ends the transfer.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// ACK with block number 0 acknowledges a WRQ or an OACK.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,

    /// Option Acknowledgment (OACK) - Opcode 6
    ///
    /// Packet format: | Opcode | Opt1 | 0 | Value1 | 0 | ... |
    OptionAck = 6,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::ReadRequest.name(), "RRQ");
    /// assert_eq!(TftpOpcode::OptionAck.name(), "OACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Standard error codes as defined in RFC 1350, plus code 8 from RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: Not defined, see error message
    NotDefined = 0,

    /// Error code 1: File not found
    FileNotFound = 1,

    /// Error code 2: Access violation
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    ///
    /// Sent for packets that are not legal in the current transfer state,
    /// unsupported modes and rejected filenames.
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,

    /// Error code 8: Option negotiation failed (RFC 2347)
    OptionNegotiationFailed = 8,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(1), Some(TftpErrorCode::FileNotFound));
    /// assert_eq!(TftpErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            8 => Some(Self::OptionNegotiationFailed),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::FileNotFound.default_message(), "File not found");
    /// ```
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Not defined, see error message (if any)",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionNegotiationFailed => "Failed to negotiate options",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
///
/// The codec carries the mode as a lowercase string; the protocol layer maps
/// it here and rejects anything that is not octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode, mode string "octet"
    Octet,

    /// Text mode, mode string "netascii". Recognized, never accepted.
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode from a string, case-insensitively
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!(TransferMode::from_str_opt("OCTET"), Some(TransferMode::Octet));
    /// assert_eq!(TransferMode::from_str_opt("mail"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    /// Get the string representation of the transfer mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }

    /// Only octet transfers are supported by the engine
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Octet)
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("Unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Negotiated DATA payload size (RFC 2348)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockSize(usize);

impl BlockSize {
    /// Default TFTP block size (512 bytes)
    pub const DEFAULT: usize = 512;

    /// Smallest block size RFC 2348 allows
    pub const MIN: usize = 8;

    /// Largest block size RFC 2348 allows
    ///
    /// 65464 keeps a DATA packet inside a single UDP datagram over IPv4.
    pub const MAX: usize = 65464;

    /// Parse an option value, rejecting anything outside `[MIN, MAX]`
    ///
    /// # Examples
    /// ```
    /// use tftp::BlockSize;
    ///
    /// assert_eq!(BlockSize::parse("1024").map(|b| b.get()), Some(1024));
    /// assert_eq!(BlockSize::parse("4"), None);
    /// assert_eq!(BlockSize::parse("lots"), None);
    /// ```
    pub fn parse(value: &str) -> Option<Self> {
        let size = value.trim().parse::<usize>().ok()?;
        (Self::MIN..=Self::MAX).contains(&size).then_some(Self(size))
    }

    /// Clamp a requested size into `[MIN, MAX]`
    ///
    /// # Examples
    /// ```
    /// use tftp::BlockSize;
    ///
    /// assert_eq!(BlockSize::clamped(100_000).get(), 65464);
    /// assert_eq!(BlockSize::clamped(1).get(), 8);
    /// assert_eq!(BlockSize::clamped(1400).get(), 1400);
    /// ```
    pub fn clamped(requested: u64) -> Self {
        let size = requested.clamp(Self::MIN as u64, Self::MAX as u64);
        Self(size as usize)
    }

    /// The size in bytes
    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered TFTP option map
///
/// Options are kept in insertion order so that encoding reproduces the
/// peer's layout byte for byte. Name lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TftpOptions {
    entries: Vec<(String, String)>,
}

impl TftpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an option, replacing the value in place if the name exists
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOptions;
    ///
    /// let mut options = TftpOptions::new();
    /// options.insert("blksize", "1024").insert("tsize", "0");
    /// options.insert("BLKSIZE", "1400");
    ///
    /// assert_eq!(options.get("blksize"), Some("1400"));
    /// assert_eq!(options.names().collect::<Vec<_>>(), ["blksize", "tsize"]);
    /// ```
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            push_cstr(buf, name);
            push_cstr(buf, value);
        }
    }

    fn from_fields(fields: Vec<String>) -> Result<Self, DecodeError> {
        if fields.len() % 2 != 0 {
            return Err(DecodeError::OddOptionFields(fields.len()));
        }

        let mut options = Self::new();
        let mut fields = fields.into_iter();
        while let (Some(name), Some(value)) = (fields.next(), fields.next()) {
            options.insert(name, value);
        }
        Ok(options)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TftpOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = Self::new();
        for (name, value) in iter {
            options.insert(name, value);
        }
        options
    }
}

impl fmt::Display for TftpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", name, value)?;
            first = false;
        }
        Ok(())
    }
}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest {
        filename: String,
        mode: String,
        options: TftpOptions,
    },
    WriteRequest {
        filename: String,
        mode: String,
        options: TftpOptions,
    },
    Data {
        block: u16,
        payload: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    OptionAck {
        options: TftpOptions,
    },
}

impl Packet {
    /// Build an octet-mode read request
    pub fn read_request(filename: impl Into<String>, options: TftpOptions) -> Self {
        Self::ReadRequest {
            filename: filename.into(),
            mode: TransferMode::Octet.as_str().to_string(),
            options,
        }
    }

    /// Build an octet-mode write request
    pub fn write_request(filename: impl Into<String>, options: TftpOptions) -> Self {
        Self::WriteRequest {
            filename: filename.into(),
            mode: TransferMode::Octet.as_str().to_string(),
            options,
        }
    }

    /// Build an ERROR packet carrying the default message for `code`
    ///
    /// # Examples
    /// ```
    /// use tftp::{Packet, TftpErrorCode};
    ///
    /// let packet = Packet::error(TftpErrorCode::FileNotFound);
    /// assert_eq!(packet.encode(), b"\x00\x05\x00\x01File not found\x00");
    /// ```
    pub fn error(code: TftpErrorCode) -> Self {
        Self::error_with_message(code, code.default_message())
    }

    pub fn error_with_message(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.as_u16(),
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::ReadRequest { .. } => TftpOpcode::ReadRequest,
            Self::WriteRequest { .. } => TftpOpcode::WriteRequest,
            Self::Data { .. } => TftpOpcode::Data,
            Self::Ack { .. } => TftpOpcode::Acknowledgment,
            Self::Error { .. } => TftpOpcode::Error,
            Self::OptionAck { .. } => TftpOpcode::OptionAck,
        }
    }

    /// Block number carried by DATA and ACK packets, 0 for everything else
    pub fn block_number(&self) -> u16 {
        match self {
            Self::Data { block, .. } | Self::Ack { block } => *block,
            _ => 0,
        }
    }

    /// Serialize the packet to its wire representation
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len_hint());
        buf.extend_from_slice(&self.opcode().as_u16().to_be_bytes());

        match self {
            Self::ReadRequest {
                filename,
                mode,
                options,
            }
            | Self::WriteRequest {
                filename,
                mode,
                options,
            } => {
                push_cstr(&mut buf, filename);
                push_cstr(&mut buf, mode);
                options.encode_into(&mut buf);
            }
            Self::Data { block, payload } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Self::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Self::Error { code, message } => {
                buf.extend_from_slice(&code.to_be_bytes());
                push_cstr(&mut buf, message);
            }
            Self::OptionAck { options } => {
                options.encode_into(&mut buf);
            }
        }

        buf
    }

    /// Parse a datagram into a packet
    ///
    /// Mode strings are folded to lowercase. Whether the mode is acceptable is
    /// decided by the protocol layer, not here.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::TooShort {
                kind: "packet",
                len: buf.len(),
            });
        }

        let raw_opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = TftpOpcode::from_u16(raw_opcode).ok_or(DecodeError::UnknownOpcode(raw_opcode))?;
        let body = &buf[2..];

        match opcode {
            TftpOpcode::ReadRequest | TftpOpcode::WriteRequest => {
                let mut fields = split_fields(body)?.into_iter();
                let filename = fields.next().ok_or(DecodeError::MissingField("filename"))?;
                let mode = fields
                    .next()
                    .ok_or(DecodeError::MissingField("mode"))?
                    .to_ascii_lowercase();
                let options = TftpOptions::from_fields(fields.collect())?;

                Ok(if opcode == TftpOpcode::ReadRequest {
                    Self::ReadRequest {
                        filename,
                        mode,
                        options,
                    }
                } else {
                    Self::WriteRequest {
                        filename,
                        mode,
                        options,
                    }
                })
            }
            TftpOpcode::Data => {
                let block = read_u16(buf, "DATA")?;
                Ok(Self::Data {
                    block,
                    payload: buf[4..].to_vec(),
                })
            }
            TftpOpcode::Acknowledgment => {
                let block = read_u16(buf, "ACK")?;
                Ok(Self::Ack { block })
            }
            TftpOpcode::Error => {
                let code = read_u16(buf, "ERROR")?;
                let msg_bytes = &buf[4..];
                // Some peers omit the terminator; take the rest of the datagram
                let end = msg_bytes.iter().position(|&b| b == 0).unwrap_or(msg_bytes.len());
                let message = String::from_utf8_lossy(&msg_bytes[..end]).into_owned();
                Ok(Self::Error { code, message })
            }
            TftpOpcode::OptionAck => {
                let options = TftpOptions::from_fields(split_fields(body)?)?;
                Ok(Self::OptionAck { options })
            }
        }
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Self::Data { payload, .. } => 4 + payload.len(),
            Self::Ack { .. } => 4,
            Self::Error { message, .. } => 5 + message.len(),
            _ => 64,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadRequest {
                filename,
                mode,
                options,
            }
            | Self::WriteRequest {
                filename,
                mode,
                options,
            } => {
                write!(f, "{} '{}' mode {}", self.opcode(), filename, mode)?;
                if !options.is_empty() {
                    write!(f, " [{}]", options)?;
                }
                Ok(())
            }
            Self::Data { block, payload } => write!(f, "DATA block {} ({} bytes)", block, payload.len()),
            Self::Ack { block } => write!(f, "ACK block {}", block),
            Self::Error { code, message } => write!(f, "ERROR {}: {}", code, message),
            Self::OptionAck { options } => write!(f, "OACK [{}]", options),
        }
    }
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf[start..].iter().position(|&b| b == 0).map(|pos| start + pos)
}

fn push_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn read_u16(buf: &[u8], kind: &'static str) -> Result<u16, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::TooShort { kind, len: buf.len() });
    }
    Ok(u16::from_be_bytes([buf[2], buf[3]]))
}

fn decode_str(bytes: &[u8], field: &'static str) -> Result<String, DecodeError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| DecodeError::InvalidString(field))
}

/// Split a section of null-terminated strings
fn split_fields(body: &[u8]) -> Result<Vec<String>, DecodeError> {
    let mut fields = Vec::new();
    let mut i = 0;

    while i < body.len() {
        let end = find_zero(body, i).ok_or(DecodeError::Unterminated)?;
        fields.push(decode_str(&body[i..end], "string field")?);
        i = end + 1;
    }

    Ok(fields)
}
