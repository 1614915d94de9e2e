//! Authorization handshake.
//!
//! One request frame out, one response frame back, on a connection that has not
//! carried anything else yet.

use crate::error::{AuthorizeError, FrameError};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{AuthorizeRequest, AuthorizeResponse};
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Authorize on a fresh connection and return the address the server assigned.
///
/// `access_address` is the address from the previous session, if any. The
/// server may hand it out again but is not obliged to.
pub async fn authorize<S>(
    stream: &mut S,
    access_address: Option<Ipv4Addr>,
    key: &str,
) -> Result<Ipv4Addr, AuthorizeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = match access_address {
        Some(addr) => AuthorizeRequest::reconnect(addr.to_string(), key),
        None => AuthorizeRequest::new(key),
    };
    let payload = request.to_bytes().map_err(AuthorizeError::Request)?;

    write_frame(stream, &payload).await.map_err(|e| match e {
        FrameError::Connection(e) => AuthorizeError::ConnectionLost(e),
        FrameError::Protocol(e) => AuthorizeError::Request(e),
    })?;
    debug!(access_address = %request.access_address, "sent authorize request");

    let reply = read_frame(stream).await.map_err(|e| match e {
        FrameError::Connection(e) => AuthorizeError::ConnectionLost(e),
        FrameError::Protocol(e) => AuthorizeError::MalformedResponse(e.to_string()),
    })?;

    let response = AuthorizeResponse::from_bytes(&reply)
        .map_err(|e| AuthorizeError::MalformedResponse(e.to_string()))?;

    if !response.is_success() {
        return Err(AuthorizeError::BadKey);
    }

    response.assigned_address.parse::<Ipv4Addr>().map_err(|_| {
        AuthorizeError::MalformedResponse(format!(
            "invalid assigned address {:?}",
            response.assigned_address
        ))
    })
}
