//! Participant side of a session.
//!
//! Manages the connection lifecycle: admission, heartbeat keepalive, decoded
//! update delivery, and clean disconnect. State changes are broadcast via a
//! [`watch`] channel so any number of consumers can react without polling.

use std::sync::Arc;
use std::time::Duration;

use mmo_config::Config;
use mmo_world::Update;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc, watch};

use crate::framing::{self, FrameConfig};
use crate::messages::{ConnectRequest, Message, Request, WireError, recv_message, send_message};
use crate::transport::{BoxedReader, BoxedWriter, SessionStream};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Admission request not yet written.
    Connecting,
    /// Admission request sent; updates may arrive.
    Connected,
    /// Closed locally, by the server, or by a transport failure.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// What the read task hands to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// An authoritative world update, in server order.
    Update(Update),
    /// The server refused admission and closed the session.
    Rejected(String),
    /// The session ended. Carries the reason.
    Closed(String),
}

/// Client connection tunables.
#[derive(Debug, Clone)]
pub struct ClientNetConfig {
    pub frame: FrameConfig,
    pub heartbeat_interval: Duration,
    /// Capacity of the event channel returned by [`GameClient::connect`].
    pub event_buffer: usize,
}

impl Default for ClientNetConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ClientNetConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame: FrameConfig::new(config.network.max_frame_size),
            heartbeat_interval: config.network.heartbeat_interval(),
            event_buffer: config.client.event_buffer.max(1),
        }
    }
}

/// Handle to an admitted (or pending) session with the server.
pub struct GameClient {
    player_id: String,
    writer: Arc<Mutex<BoxedWriter>>,
    state: Arc<ConnectionStateWatch>,
    frame: FrameConfig,
    /// Sending `true` causes reader and heartbeat tasks to exit.
    shutdown_tx: watch::Sender<bool>,
}

impl GameClient {
    /// Sends the admission request for `player_id` over `stream` and spawns
    /// the read and heartbeat tasks.
    ///
    /// The returned receiver yields decoded updates in the order the server
    /// sent them. Admission failure arrives as [`ClientEvent::Rejected`].
    pub async fn connect(
        stream: SessionStream,
        player_id: &str,
        config: ClientNetConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), WireError> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let SessionStream {
            reader,
            mut writer,
            peer,
        } = stream;

        let hello = Message::Request(Request::Connect(ConnectRequest {
            id: player_id.to_string(),
        }));
        if let Err(e) = send_message(&mut writer, &hello, &config.frame).await {
            state.set(ConnectionState::Disconnected);
            return Err(e);
        }
        state.set(ConnectionState::Connected);
        tracing::info!("Connecting to {peer} as {player_id:?}");

        let writer = Arc::new(Mutex::new(writer));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);

        let reader_state = Arc::clone(&state);
        let reader_frame = config.frame.clone();
        let mut reader_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            Self::read_loop(reader, &reader_frame, &events_tx, &reader_state, &mut reader_shutdown)
                .await;
        });

        let hb_writer = Arc::clone(&writer);
        let hb_state = Arc::clone(&state);
        let mut hb_shutdown = shutdown_rx;
        let interval = config.heartbeat_interval;
        tokio::spawn(async move {
            Self::heartbeat_loop(&hb_writer, interval, &hb_state, &mut hb_shutdown).await;
        });

        Ok((
            Self {
                player_id: player_id.to_string(),
                writer,
                state,
                frame: config.frame,
                shutdown_tx,
            },
            events_rx,
        ))
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Sends one request to the server.
    pub async fn send(&self, request: Request) -> Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        let result = send_message(&mut *writer, &Message::Request(request), &self.frame).await;
        if result.is_err() {
            self.state.set(ConnectionState::Disconnected);
        }
        result
    }

    /// Stops the background tasks and closes the write side, which the
    /// server observes as end of stream.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        self.state.set(ConnectionState::Disconnected);
        let _ = self.writer.lock().await.shutdown().await;
    }

    async fn read_loop(
        mut reader: BoxedReader,
        frame: &FrameConfig,
        events: &mpsc::Sender<ClientEvent>,
        state: &ConnectionStateWatch,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                result = recv_message(&mut reader, frame) => match result {
                    Ok(None) => continue,
                    Ok(Some(Message::Update(update))) => {
                        tracing::trace!("Received {}", update.kind());
                        if events.send(ClientEvent::Update(update)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Ok(Some(Message::Error(e))) => {
                        tracing::warn!("Server rejected session: {}", e.text);
                        ClientEvent::Rejected(e.text)
                    }
                    Ok(Some(other)) => {
                        tracing::warn!("Server sent unexpected {}", other.kind());
                        ClientEvent::Closed(format!("protocol violation: unexpected {}", other.kind()))
                    }
                    Err(e) => {
                        tracing::info!("Session closed: {e}");
                        ClientEvent::Closed(e.to_string())
                    }
                },
                _ = shutdown_rx.changed() => break,
            };
            state.set(ConnectionState::Disconnected);
            let _ = events.send(event).await;
            break;
        }
    }

    /// Write a heartbeat frame every `period` until shutdown or write failure.
    async fn heartbeat_loop(
        writer: &Mutex<BoxedWriter>,
        period: Duration,
        state: &ConnectionStateWatch,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if state.current() != ConnectionState::Connected {
                        break;
                    }
                    let mut w = writer.lock().await;
                    if let Err(e) = framing::write_heartbeat(&mut *w).await {
                        tracing::debug!("Heartbeat failed: {e}");
                        state.set(ConnectionState::Disconnected);
                        break;
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }
}
