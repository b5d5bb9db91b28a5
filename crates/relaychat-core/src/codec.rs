//! Length-prefixed message framing
//!
//! Frame layout:
//!
//! ```text
//! +-------+-------------+------------------+
//! | magic | length (BE) | bincode payload  |
//! | 4 B   | 4 B         | length bytes     |
//! +-------+-------------+------------------+
//! ```
//!
//! Reads use `read_exact` on the header and then on the payload, so a reader
//! never consumes bytes past the end of the current frame. A connection can
//! therefore switch from framed control messages to raw bytes at any frame
//! boundary.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Frame magic bytes
pub const FRAME_MAGIC: [u8; 4] = *b"RCHT";

/// Frame header size (magic + length)
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum frame payload size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encode a message payload with bincode
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the message cannot be encoded.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

/// Decode a message payload with bincode
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the bytes are not a valid message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Write one frame carrying `payload`
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the payload exceeds [`MAX_FRAME_SIZE`], or
/// an I/O error from the underlying writer.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::protocol("frame exceeds maximum size"));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and return its payload
///
/// # Errors
///
/// Returns [`Error::ClosedStream`] if the peer closed the connection on a
/// frame boundary, [`Error::Protocol`] on a bad magic or oversized length,
/// or an I/O error otherwise.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ClosedStream);
        }
        Err(e) => return Err(e.into()),
    }

    if header[..4] != FRAME_MAGIC {
        return Err(Error::protocol("bad frame magic"));
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::protocol("frame exceeds maximum size"));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Encode and write one message
///
/// # Errors
///
/// See [`encode`] and [`write_frame`].
pub async fn send_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let payload = encode(message)?;
    write_frame(writer, &payload).await
}

/// Read and decode one message
///
/// # Errors
///
/// See [`read_frame`] and [`decode`].
pub async fn recv_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    decode(&payload)
}
