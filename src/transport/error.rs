//! Transport layer error types.

use std::io;

use thiserror::Error;

use super::frame::FrameError;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Frame parsing or size violation. The stream is no longer usable.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// The peer address is not a valid TLS server name.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// TCP connect did not complete in time.
    #[error("dial timed out")]
    DialTimeout,

    /// TLS handshake did not complete in time.
    #[error("tls handshake timed out")]
    HandshakeTimeout,

    /// Read deadline exceeded.
    #[error("read timed out")]
    ReadTimeout,

    /// Write deadline exceeded.
    #[error("write timed out")]
    WriteTimeout,

    /// The link or session is closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl TransportError {
    /// Framing violation from the remote side.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, TransportError::Frame(_))
    }

    /// Any deadline expiry.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::DialTimeout
            | TransportError::HandshakeTimeout
            | TransportError::ReadTimeout
            | TransportError::WriteTimeout => true,
            TransportError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// The local side closed the link.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed)
    }

    /// The remote end is gone or unreachable.
    ///
    /// Used to decide whether a failed write should tear the session down.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WriteZero
            ),
            TransportError::ReadTimeout
            | TransportError::WriteTimeout
            | TransportError::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Whether dialing again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Frame(_)
            | TransportError::Tls(_)
            | TransportError::InvalidServerName(_) => false,
            TransportError::Io(_)
            | TransportError::DialTimeout
            | TransportError::HandshakeTimeout
            | TransportError::ReadTimeout
            | TransportError::WriteTimeout
            | TransportError::ConnectionClosed => true,
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
