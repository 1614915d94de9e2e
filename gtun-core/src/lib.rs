//! Core types and protocols for the gtun tunnel.
//!
//! This crate holds everything a peer needs to speak the wire protocol:
//! length-prefixed framing, the authorize handshake and the error taxonomy.

pub mod auth;
pub mod error;
pub mod frame;
pub mod protocol;

pub use auth::authorize;
pub use error::{
    AuthorizeError, ConfigError, ConnectionError, ErrorCategory, FrameError, ProtocolError,
    TunnelError, TunnelResult,
};
pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use protocol::{AuthorizeRequest, AuthorizeResponse, AuthorizeStatus};
