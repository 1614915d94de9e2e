//! Length-prefixed framing over a byte stream.
//!
//! Every message on the wire, handshake or data, is a 4 byte big-endian length
//! followed by exactly that many payload bytes. Reads and writes always run to
//! completion so a frame is never left half consumed on the stream.

use crate::error::{ConnectionError, FrameError, ProtocolError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_LEN: usize = 65536;

/// Encode a payload into a complete frame.
///
/// Payloads larger than [`MAX_FRAME_LEN`] are rejected rather than truncated.
pub fn encode(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::OversizedFrame {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encode `payload` and write the whole frame to `writer`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(payload)?;
    // write_all keeps going across short writes until the frame is out.
    writer
        .write_all(&frame)
        .await
        .map_err(ConnectionError::from_io)?;
    writer.flush().await.map_err(ConnectionError::from_io)?;
    trace!("wrote frame of {} bytes", payload.len());
    Ok(())
}

/// Read exactly one frame from `reader` and return its payload.
///
/// The declared length is validated before any payload byte is read.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(ConnectionError::from_io)?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::OversizedFrame {
            len,
            max: MAX_FRAME_LEN,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(ConnectionError::from_io)?;
    trace!("read frame of {} bytes", len);
    Ok(Bytes::from(payload))
}
