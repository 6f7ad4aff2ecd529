//! Wire messages and their codec.
//!
//! Every message is serialized with [`postcard`] and prefixed with a protocol
//! version byte, then carried in one frame (see [`crate::framing`]). Decoding
//! fails closed: anything that is not exactly one well-formed message of the
//! current version is an error.

use std::time::Duration;

use mmo_world::{DVec2, Timestamp, Update};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::framing::{self, Frame, FrameConfig, FrameError};

/// Current wire-protocol version. Prepended to every serialized message.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Top-level envelope. Requests flow participant to server; updates and
/// errors flow server to participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    Request(Request),
    Update(Update),
    Error(ErrorMessage),
}

/// Something a participant asks the server to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Request {
    /// Must be the first message on every session stream.
    Connect(ConnectRequest),
    Move(MoveRequest),
    Speak(SpeakRequest),
}

/// Admission request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectRequest {
    /// Requested player ID. Must be non-empty and not held by an active session.
    pub id: String,
}

/// Move one step in `direction`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MoveRequest {
    pub direction: DVec2,
    /// Client-side creation time, echoed back as `PlayerMoved::request_time`.
    pub created: Timestamp,
}

/// Say a line of text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeakRequest {
    pub text: String,
}

/// Server-to-participant error, sent once before the server closes the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorMessage {
    pub text: String,
}

impl Message {
    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(Request::Connect(_)) => "ConnectRequest",
            Self::Request(Request::Move(_)) => "MoveRequest",
            Self::Request(Request::Speak(_)) => "SpeakRequest",
            Self::Update(update) => update.kind(),
            Self::Error(_) => "Error",
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Update> for Message {
    fn from(update: Update) -> Self {
        Self::Update(update)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while encoding or decoding a message payload.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("empty payload, no version byte")]
    EmptyPayload,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Errors from reading or writing messages on a stream.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl WireError {
    /// Whether the peer simply went away, as opposed to misbehaving.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Frame(FrameError::ConnectionClosed))
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialize a message into a versioned payload.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, MessageError> {
    let mut buf = vec![PROTOCOL_VERSION];
    let body = postcard::to_allocvec(msg)?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Deserialize a versioned payload.
pub fn decode_message(data: &[u8]) -> Result<Message, MessageError> {
    let (&version, body) = data.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    let (msg, rest) = postcard::take_from_bytes::<Message>(body)?;
    if !rest.is_empty() {
        return Err(MessageError::TrailingBytes(rest.len()));
    }
    Ok(msg)
}

/// Encode a message as a complete frame, prefix included.
pub fn encode_message_frame(msg: &Message, config: &FrameConfig) -> Result<Vec<u8>, WireError> {
    let payload = encode_message(msg)?;
    Ok(framing::encode_frame(&payload, config)?)
}

/// Write one message as a frame.
pub async fn send_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
    config: &FrameConfig,
) -> Result<(), WireError> {
    let payload = encode_message(msg)?;
    framing::write_frame(writer, &payload, config).await?;
    Ok(())
}

/// Read one frame. Heartbeats yield `None`.
pub async fn recv_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Option<Message>, WireError> {
    match framing::read_frame(reader, config).await? {
        Frame::Heartbeat => Ok(None),
        Frame::Payload(payload) => Ok(Some(decode_message(&payload)?)),
    }
}
