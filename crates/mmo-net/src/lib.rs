//! Networking: message framing, the wire codec, TCP and QUIC session streams,
//! and the participant-side connection.

pub mod client;
pub mod framing;
pub mod messages;
pub mod quic;
pub mod transport;

pub use client::{ClientEvent, ClientNetConfig, ConnectionState, ConnectionStateWatch, GameClient};
pub use framing::{Frame, FrameConfig, FrameError, encode_frame, read_frame, write_encoded, write_frame};
pub use messages::{
    ConnectRequest, ErrorMessage, Message, MessageError, MoveRequest, PROTOCOL_VERSION, Request,
    SpeakRequest, WireError, decode_message, encode_message, encode_message_frame, recv_message,
    send_message,
};
pub use quic::{QuicConnector, QuicError, QuicIdentity, QuicListener};
pub use transport::{BoxedReader, BoxedWriter, Listener, SessionStream, TransportError, dial};
