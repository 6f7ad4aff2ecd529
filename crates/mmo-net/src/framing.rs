//! Length-prefixed framing for session streams.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself. A zero-length frame is a
//! heartbeat: it proves the peer is alive and carries no message.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const PREFIX_LEN: usize = 4;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

impl FrameConfig {
    pub fn new(max_payload_size: u32) -> Self {
        Self { max_payload_size }
    }

    fn check(&self, len: usize) -> Result<u32, FrameError> {
        match u32::try_from(len) {
            Ok(size) if size <= self.max_payload_size => Ok(size),
            _ => Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.max_payload_size,
            }),
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: u32 },

    /// The peer closed the stream, possibly mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Zero-length liveness probe.
    Heartbeat,
    /// A non-empty payload.
    Payload(Vec<u8>),
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single frame. Waits until the whole frame is available.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Frame, FrameError> {
    let mut len_buf = [0u8; PREFIX_LEN];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;

    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len as usize,
            max: config.max_payload_size,
        });
    }
    if payload_len == 0 {
        return Ok(Frame::Heartbeat);
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;
    Ok(Frame::Payload(payload))
}

/// Prefix `payload` with its length, producing bytes ready for
/// [`write_encoded`]. Used to encode a broadcast once for every recipient.
pub fn encode_frame(payload: &[u8], config: &FrameConfig) -> Result<Vec<u8>, FrameError> {
    let len = config.check(payload.len())?;
    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Write a single length-prefixed frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = config.check(payload.len())?;
    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Write bytes produced by [`encode_frame`] and flush.
pub async fn write_encoded<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), FrameError> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a heartbeat frame.
pub async fn write_heartbeat<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), FrameError> {
    write_encoded(writer, &0u32.to_le_bytes()).await
}
