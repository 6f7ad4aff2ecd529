//! Transport-agnostic session streams.
//!
//! Upper layers only ever see a [`SessionStream`]: a boxed reader, a boxed
//! writer, and a peer label. TCP yields one per connection; QUIC yields one
//! per bidirectional stream.

use std::io;
use std::net::SocketAddr;

use mmo_config::{NetworkConfig, TransportKind};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::quic::{QuicConnector, QuicError, QuicIdentity, QuicListener};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Quic(#[from] QuicError),

    #[error("could not resolve {0}")]
    Unresolved(String),

    #[error("QUIC transport requires a server identity")]
    MissingIdentity,
}

/// One participant's bidirectional byte stream.
pub struct SessionStream {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Human-readable peer label for logs.
    pub peer: String,
}

impl SessionStream {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, peer: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            peer: peer.into(),
        }
    }

    /// Wraps an accepted or dialed TCP connection.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self::new(Box::new(reader), Box::new(writer), peer))
    }

    /// Two connected in-memory sessions, for tests and local play.
    pub fn in_memory_pair(buffer: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(buffer);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self::new(Box::new(a_read), Box::new(a_write), "memory:a"),
            Self::new(Box::new(b_read), Box::new(b_write), "memory:b"),
        )
    }
}

impl std::fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStream").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Resolves `host:port` to the first socket address.
pub async fn resolve(endpoint: &str) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host(endpoint)
        .await?
        .next()
        .ok_or_else(|| TransportError::Unresolved(endpoint.to_string()))
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Server-side source of session streams.
pub enum Listener {
    Tcp(TcpListener),
    Quic(QuicListener),
}

impl Listener {
    /// Binds the transport named in `network`. QUIC needs an `identity`.
    pub async fn bind(
        network: &NetworkConfig,
        identity: Option<&QuicIdentity>,
    ) -> Result<Self, TransportError> {
        let addr = resolve(&network.endpoint()).await?;
        match network.transport {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(addr).await?;
                tracing::info!("TCP listening on {}", listener.local_addr()?);
                Ok(Self::Tcp(listener))
            }
            TransportKind::Quic => {
                let identity = identity.ok_or(TransportError::MissingIdentity)?;
                Ok(Self::Quic(QuicListener::bind(addr, identity)?))
            }
        }
    }

    /// Waits for the next session stream.
    pub async fn accept(&mut self) -> Result<SessionStream, TransportError> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(SessionStream::from_tcp(stream)?)
            }
            Self::Quic(listener) => listener
                .accept()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "QUIC endpoint closed").into()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr(),
            Self::Quic(listener) => listener.local_addr(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Tcp(_) => TransportKind::Tcp,
            Self::Quic(_) => TransportKind::Quic,
        }
    }
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

/// Opens one session stream to the server named in `network`.
///
/// `trusted` holds DER certificates the QUIC client accepts; it is ignored
/// for TCP. Use [`QuicConnector`] directly to open several sessions over one
/// QUIC connection.
pub async fn dial(network: &NetworkConfig, trusted: &[Vec<u8>]) -> Result<SessionStream, TransportError> {
    let addr = resolve(&network.endpoint()).await?;
    match network.transport {
        TransportKind::Tcp => Ok(SessionStream::from_tcp(TcpStream::connect(addr).await?)?),
        TransportKind::Quic => {
            let connector = QuicConnector::connect(addr, &network.quic_server_name, trusted).await?;
            Ok(connector.open_session().await?)
        }
    }
}
