//! QUIC transport.
//!
//! One QUIC connection can carry several participant sessions: every
//! bidirectional stream the peer opens is an independent [`SessionStream`]
//! with its own framing, ordering, and flow control.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use quinn::rustls::RootCertStore;
use quinn::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use quinn::{Connection, Endpoint};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::SessionStream;

/// Sessions accepted but not yet picked up by the accept loop.
const ACCEPT_BACKLOG: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum QuicError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] quinn::rustls::Error),

    #[error("client trust configuration failed: {0}")]
    Verifier(#[from] quinn::rustls::client::VerifierBuilderError),

    #[error("invalid private key: {0}")]
    InvalidKey(&'static str),

    #[error("connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Server certificate chain and private key.
#[derive(Debug)]
pub struct QuicIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl QuicIdentity {
    /// Generates a self-signed certificate valid for `hostnames`.
    pub fn self_signed(hostnames: &[String]) -> Result<Self, QuicError> {
        let certified = rcgen::generate_simple_self_signed(hostnames.to_vec())?;
        let cert = CertificateDer::from(certified.cert.der().to_vec());
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        Ok(Self {
            cert_chain: vec![cert],
            key: key.into(),
        })
    }

    /// Loads a DER certificate and a DER private key from disk.
    pub fn from_der_files(cert_path: &Path, key_path: &Path) -> Result<Self, QuicError> {
        let cert = CertificateDer::from(std::fs::read(cert_path)?);
        let key = PrivateKeyDer::try_from(std::fs::read(key_path)?).map_err(QuicError::InvalidKey)?;
        Ok(Self {
            cert_chain: vec![cert],
            key,
        })
    }

    /// DER bytes of the leaf certificate, for clients to trust.
    pub fn certificate_der(&self) -> &[u8] {
        self.cert_chain.first().map(|c| c.as_ref()).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Accepts connections and yields every bidirectional stream as a session.
pub struct QuicListener {
    endpoint: Endpoint,
    sessions: mpsc::Receiver<SessionStream>,
    acceptor: JoinHandle<()>,
}

impl QuicListener {
    /// Binds a QUIC endpoint on `addr`.
    pub fn bind(addr: SocketAddr, identity: &QuicIdentity) -> Result<Self, QuicError> {
        let server_config =
            quinn::ServerConfig::with_single_cert(identity.cert_chain.clone(), identity.key.clone_key())?;
        let endpoint = Endpoint::server(server_config, addr)?;
        let (tx, sessions) = mpsc::channel(ACCEPT_BACKLOG);

        let accepting = endpoint.clone();
        let acceptor = tokio::spawn(async move {
            while let Some(incoming) = accepting.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => accept_streams(connection, tx).await,
                        Err(e) => tracing::debug!("QUIC handshake failed: {e}"),
                    }
                });
            }
        });

        tracing::info!("QUIC listening on {}", endpoint.local_addr()?);
        Ok(Self {
            endpoint,
            sessions,
            acceptor,
        })
    }

    /// Next session stream, or `None` once the endpoint is closed.
    pub async fn accept(&mut self) -> Option<SessionStream> {
        self.sessions.recv().await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Closes every connection and stops accepting.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server shutdown");
        self.acceptor.abort();
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_streams(connection: Connection, tx: mpsc::Sender<SessionStream>) {
    let remote = connection.remote_address();
    tracing::debug!("QUIC connection from {remote}");
    let mut stream_index = 0u64;
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                stream_index += 1;
                let peer = format!("{remote}#{stream_index}");
                let session = SessionStream::new(Box::new(recv), Box::new(send), peer);
                if tx.send(session).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("QUIC connection {remote} ended: {e}");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// A client connection that can open any number of session streams.
#[derive(Clone)]
pub struct QuicConnector {
    endpoint: Endpoint,
    connection: Connection,
}

impl QuicConnector {
    /// Connects to `addr`, trusting only the given certificates.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        trusted: &[Vec<u8>],
    ) -> Result<Self, QuicError> {
        let mut roots = RootCertStore::empty();
        for der in trusted {
            roots.add(CertificateDer::from(der.clone()))?;
        }
        let client_config = quinn::ClientConfig::with_root_certificates(Arc::new(roots))?;

        let bind = if addr.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint.connect(addr, server_name)?.await?;
        tracing::debug!("QUIC connected to {addr}");
        Ok(Self {
            endpoint,
            connection,
        })
    }

    /// Opens a new bidirectional stream as an independent session.
    ///
    /// The server only sees the stream once something is written to it.
    pub async fn open_session(&self) -> Result<SessionStream, QuicError> {
        let (send, recv) = self.connection.open_bi().await?;
        let peer = self.connection.remote_address().to_string();
        Ok(SessionStream::new(
            Box::new(KeepAlive::new(recv, self.endpoint.clone())),
            Box::new(KeepAlive::new(send, self.endpoint.clone())),
            peer,
        ))
    }

    pub fn close(&self) {
        self.connection.close(0u32.into(), b"client closed");
    }
}

/// Holds the client endpoint open for as long as one of its streams lives.
struct KeepAlive<S> {
    inner: S,
    _endpoint: Endpoint,
}

impl<S> KeepAlive<S> {
    fn new(inner: S, endpoint: Endpoint) -> Self {
        Self {
            inner,
            _endpoint: endpoint,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for KeepAlive<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for KeepAlive<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
