use thiserror::Error;

use crate::config::ConfigError;
use crate::connection::ConnectionStatus;

/// What exactly went wrong while decoding a RESP token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolErrorKind {
    #[error("unexpected byte 0x{0:02x}")]
    UnexpectedControlByte(u8),
    #[error("line not terminated by CRLF")]
    UnterminatedLine,
    #[error("bulk string payload not terminated by CRLF")]
    UnterminatedBulkString,
    #[error("invalid digit in numeric token")]
    InvalidIntegerDigit,
    #[error("number does not fit in a signed 64-bit integer")]
    IntegerOverflow,
    #[error("declared length is out of range")]
    LengthOutOfRange,
    #[error("null length is not allowed here")]
    UnexpectedNull,
}

/// A framing violation in the incoming byte stream.
///
/// `byte_offset` is relative to the first byte of the token being decoded,
/// so it stays meaningful regardless of how the stream was fragmented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("protocol violation at byte {byte_offset}: {kind}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub byte_offset: u64,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, byte_offset: u64) -> Self {
        Self { kind, byte_offset }
    }
}

/// A validation failure while encoding outgoing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("simple string payload contains CR or LF")]
    SimpleStringContainsNewline,
    #[error("bulk string exceeds the 512 MiB protocol limit")]
    BulkStringTooLarge,
    #[error("invalid array length")]
    ArrayLengthInvalid,
}

/// Everything that can surface from the public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("transport failure")]
    Transport(#[from] std::io::Error),

    /// The connection already failed; nothing can be issued on it anymore.
    #[error("connection is broken")]
    ConnectionBroken,

    #[error("server rejected the handshake: {}", .server_message.as_deref().unwrap_or("connection closed"))]
    HandshakeFailed { server_message: Option<String> },

    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("operation canceled")]
    Canceled,

    #[error("{0}")]
    ArgumentOutOfRange(&'static str),

    #[error("operation not allowed while the connection is {0:?}")]
    InvalidState(ConnectionStatus),
}

pub type Result<T> = std::result::Result<T, Error>;
