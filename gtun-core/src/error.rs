//! Error types for the tunnel client.
//!
//! Connection failures, protocol violations, authorization outcomes and local
//! interface configuration failures are separate types so the supervisor can
//! tell a transient outage from a condition that retrying cannot fix.

use std::fmt;
use std::io;
use thiserror::Error;

/// Error categories for the tunnel system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Authentication-related errors.
    Authentication,
    /// Connection and network errors.
    Connection,
    /// Protocol parsing/validation errors.
    Protocol,
    /// Local interface configuration errors.
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Configuration => write!(f, "configuration"),
        }
    }
}

/// Failures of the transport connection itself.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to dial {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connection closed by peer")]
    Closed,
    #[error("connection I/O failure: {0}")]
    IoFailure(#[source] io::Error),
}

impl ConnectionError {
    /// Classify an I/O error raised while reading or writing a connection.
    ///
    /// Running out of bytes mid-frame means the peer went away, so it maps to
    /// [`ConnectionError::Closed`]; everything else is an I/O failure.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => ConnectionError::Closed,
            _ => ConnectionError::IoFailure(err),
        }
    }
}

/// Violations of the framing or handshake protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    OversizedFrame { len: usize, max: usize },
    #[error("malformed handshake message: {0}")]
    MalformedHandshake(String),
}

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Outcomes of a failed authorize handshake.
#[derive(Debug, Error)]
pub enum AuthorizeError {
    #[error("server rejected the authorization key")]
    BadKey,
    #[error("malformed authorize response: {0}")]
    MalformedResponse(String),
    #[error("connection lost during handshake: {0}")]
    ConnectionLost(#[source] ConnectionError),
    #[error("cannot send authorize request: {0}")]
    Request(#[source] ProtocolError),
}

impl AuthorizeError {
    /// Whether retrying the handshake with the same credentials is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuthorizeError::BadKey | AuthorizeError::Request(_))
    }
}

/// Failures configuring the local virtual interface.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to bring up {device}: {reason}")]
    InterfaceUp { device: String, reason: String },
    #[error("failed to assign {address} to {device}: {reason}")]
    AddressAssign {
        device: String,
        address: String,
        reason: String,
    },
}

/// Session-level error, the union of everything that can end or interrupt a
/// tunnel session.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Authorize(#[from] AuthorizeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("gave up after {attempts} connection attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<TunnelError>,
    },
}

impl From<FrameError> for TunnelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Connection(e) => TunnelError::Connection(e),
            FrameError::Protocol(e) => TunnelError::Protocol(e),
        }
    }
}

impl TunnelError {
    /// The category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TunnelError::Connection(_) => ErrorCategory::Connection,
            TunnelError::Protocol(_) => ErrorCategory::Protocol,
            TunnelError::Authorize(AuthorizeError::BadKey) => ErrorCategory::Authentication,
            TunnelError::Authorize(AuthorizeError::ConnectionLost(_)) => ErrorCategory::Connection,
            TunnelError::Authorize(_) => ErrorCategory::Protocol,
            TunnelError::Config(_) => ErrorCategory::Configuration,
            TunnelError::Exhausted { last, .. } => last.category(),
        }
    }

    /// Check if another connection attempt could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::Connection(_) => true,
            TunnelError::Authorize(e) => !e.is_fatal(),
            TunnelError::Protocol(_) | TunnelError::Config(_) | TunnelError::Exhausted { .. } => {
                false
            }
        }
    }
}

/// Result type using TunnelError.
pub type TunnelResult<T> = Result<T, TunnelError>;
