//! Authoritative tick loop.
//!
//! The [`UpdateManager`] owns the server's [`World`] and every admitted
//! [`Session`]. Each tick it first drains every active session's request
//! queue and applies the results, then drains the deferred queue of
//! publications and snapshot deliveries in FIFO order. Only the tick task
//! drains that queue, so every participant sees updates in the same order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use mmo_config::Config;
use mmo_net::{
    BoxedReader, ErrorMessage, FrameConfig, Message, MoveRequest, Request, SessionStream,
    SpeakRequest, WireError, encode_message_frame, recv_message, send_message,
};
use mmo_world::{
    AddPlayer, DVec2, MonotonicClock, PlayerMoved, PlayerSpoke, RemovePlayer, Update, World,
    WorldError,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::error::SyncError;
use crate::session::{RequestSender, Session, SessionState};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Server tunables, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub tick_interval: Duration,
    pub request_queue_capacity: usize,
    /// Deadline for one write to one recipient.
    pub broadcast_timeout: Duration,
    /// Deadline for the first message on a new stream.
    pub handshake_timeout: Duration,
    pub spawn_position: DVec2,
    /// Distance covered by one unit-length move.
    pub move_step: f64,
    /// Longest accepted speech, in characters.
    pub max_speech_length: usize,
    pub frame: FrameConfig,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Self {
        let (x, y) = config.server.spawn_position;
        Self {
            tick_interval: config.server.tick_interval(),
            request_queue_capacity: config.server.request_queue_capacity,
            broadcast_timeout: config.server.broadcast_timeout(),
            handshake_timeout: config.network.handshake_timeout(),
            spawn_position: DVec2::new(x, y),
            move_step: config.world.move_step,
            max_speech_length: config.server.max_speech_length,
            frame: FrameConfig::new(config.network.max_frame_size),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Deferred work
// ---------------------------------------------------------------------------

/// Work queued for the second phase of a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Deferred {
    /// Apply to the world, then broadcast. Nothing is sent if applying fails.
    Publish(Update),
    /// Broadcast an update that was already applied.
    Broadcast(Update),
    /// Send the current snapshot to one session and activate it.
    SyncWorld(String),
}

/// A session that passed admission, with the pieces its read task needs.
pub struct AdmittedSession {
    pub session: Arc<Session>,
    reader: BoxedReader,
    requests: RequestSender,
}

// ---------------------------------------------------------------------------
// UpdateManager
// ---------------------------------------------------------------------------

pub struct UpdateManager {
    world: World,
    sessions: RwLock<BTreeMap<String, Arc<Session>>>,
    deferred: Mutex<VecDeque<Deferred>>,
    /// Held for the whole deferred drain so two drains never interleave.
    drain_lock: tokio::sync::Mutex<()>,
    clock: MonotonicClock,
    settings: ServerSettings,
}

impl UpdateManager {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            world: World::new(),
            sessions: RwLock::new(BTreeMap::new()),
            deferred: Mutex::new(VecDeque::new()),
            drain_lock: tokio::sync::Mutex::new(()),
            clock: MonotonicClock::new(),
            settings,
        }
    }

    /// The authoritative world.
    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Number of admitted sessions, connecting or active.
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn session(&self, player_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(player_id)
            .cloned()
    }

    /// Active sessions ordered by player ID.
    fn active_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    fn defer_locked(&self, items: impl IntoIterator<Item = Deferred>) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(items);
    }

    /// Queues work for the next deferred drain.
    pub fn defer(&self, item: Deferred) {
        self.defer_locked([item]);
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    // --- Admission ---

    /// Reads the admission request from a new stream and registers a
    /// session for it.
    ///
    /// Heartbeats before the request are skipped. Anything other than a
    /// `ConnectRequest` with a non-empty ID is a protocol violation. An ID
    /// held by another session is answered with an error message, after
    /// which the stream is closed.
    pub async fn admit(&self, stream: SessionStream) -> Result<AdmittedSession, SyncError> {
        let SessionStream {
            mut reader,
            writer,
            peer,
        } = stream;

        let deadline = self.settings.handshake_timeout;
        let id = tokio::time::timeout(deadline, read_connect(&mut reader, &self.settings.frame))
            .await
            .map_err(|_| WireError::TimedOut(deadline))??;

        let registered = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            if sessions.contains_key(&id) {
                Err(writer)
            } else {
                let (session, requests) = Session::new(
                    id.clone(),
                    peer.clone(),
                    writer,
                    self.settings.request_queue_capacity,
                );
                let session = Arc::new(session);
                sessions.insert(id.clone(), Arc::clone(&session));
                // Queued under the session lock so a concurrent disconnect of
                // the same ID cannot reorder AddPlayer and RemovePlayer.
                self.defer_locked([
                    Deferred::Publish(Update::AddPlayer(AddPlayer {
                        id: id.clone(),
                        position: self.settings.spawn_position,
                    })),
                    Deferred::SyncWorld(id.clone()),
                ]);
                Ok((session, requests))
            }
        };

        let mut writer = match registered {
            Ok((session, requests)) => {
                tracing::info!("Admitted {id:?} from {peer}");
                return Ok(AdmittedSession {
                    session,
                    reader,
                    requests,
                });
            }
            Err(writer) => writer,
        };

        tracing::warn!("Rejecting {id:?} from {peer}: already connected");
        let rejection = Message::Error(ErrorMessage {
            text: format!("player {id:?} is already connected"),
        });
        let _ = tokio::time::timeout(
            self.settings.broadcast_timeout,
            send_message(&mut writer, &rejection, &self.settings.frame),
        )
        .await;
        let _ = writer.shutdown().await;
        Err(SyncError::AdmissionConflict(id))
    }

    /// Runs an admitted session's read loop until the stream fails, the
    /// peer violates the protocol, or the session is closed. Then removes
    /// the player. Returns why the session ended.
    pub async fn serve(&self, admitted: AdmittedSession) -> SyncError {
        let AdmittedSession {
            session,
            mut reader,
            requests,
        } = admitted;
        let frame = &self.settings.frame;

        let reason = loop {
            tokio::select! {
                biased;
                _ = session.closed() => break SyncError::Closed("closed by server".to_string()),
                result = recv_message(&mut reader, frame) => match result {
                    Ok(None) => tracing::trace!("Heartbeat from {}", session.player_id()),
                    Ok(Some(Message::Request(Request::Connect(_)))) => {
                        break SyncError::ProtocolViolation("repeated ConnectRequest".to_string());
                    }
                    Ok(Some(Message::Request(request))) => {
                        tokio::select! {
                            biased;
                            _ = session.closed() => {
                                break SyncError::Closed("closed by server".to_string());
                            }
                            sent = requests.send(request) => {
                                if sent.is_err() {
                                    break SyncError::Closed("request queue dropped".to_string());
                                }
                            }
                        }
                    }
                    Ok(Some(other)) => {
                        break SyncError::ProtocolViolation(format!("client sent {}", other.kind()));
                    }
                    Err(e) => break SyncError::Transport(e),
                },
            }
        };

        match &reason {
            SyncError::Transport(e) if e.is_closed() => {
                tracing::info!("{} disconnected", session.player_id());
            }
            other => tracing::warn!("Closing session {}: {other}", session.player_id()),
        }
        self.disconnect(&session);
        session.shutdown_writer().await;
        reason
    }

    /// Admission followed by [`serve`](Self::serve).
    pub async fn run_session(&self, stream: SessionStream) -> SyncError {
        let peer = stream.peer.clone();
        match self.admit(stream).await {
            Ok(admitted) => self.serve(admitted).await,
            Err(e) => {
                tracing::warn!("Admission from {peer} failed: {e}");
                e
            }
        }
    }

    /// Closes `session` and, if it is still the registered session for its
    /// player, releases the ID and queues the player's removal.
    pub fn disconnect(&self, session: &Arc<Session>) {
        session.close();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let id = session.player_id();
        if sessions.get(id).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(id);
            self.defer_locked([Deferred::Publish(Update::RemovePlayer(RemovePlayer {
                id: id.to_string(),
            }))]);
        }
    }

    /// Closes every session. Their read tasks remove the players.
    pub fn close_all(&self) {
        for session in self.sessions.read().unwrap_or_else(PoisonError::into_inner).values() {
            session.close();
        }
    }

    // --- Tick ---

    /// One tick: process queued requests, then drain deferred work.
    ///
    /// Per-request faults are logged and dropped. The first deferred
    /// failure ends the drain and is returned; later items wait for the
    /// next tick.
    pub async fn tick(&self) -> Result<(), SyncError> {
        for session in self.active_sessions() {
            for request in session.drain_requests() {
                if let Err(e) = self.handle_request(&session, request) {
                    tracing::warn!("Dropped request from {}: {e}", session.player_id());
                }
            }
        }
        self.drain_deferred().await
    }

    fn handle_request(&self, session: &Session, request: Request) -> Result<(), SyncError> {
        let id = session.player_id();
        match request {
            Request::Move(MoveRequest { direction, created }) => {
                if direction == DVec2::ZERO || !direction.is_finite() {
                    tracing::trace!("Ignoring empty move from {id}");
                    return Ok(());
                }
                if !session.record_move(&MoveRequest { direction, created }) {
                    tracing::debug!("Ignoring replayed move from {id}");
                    return Ok(());
                }
                let player = self
                    .world
                    .get_active(id)
                    .ok_or_else(|| WorldError::NotFoundOrInactive(id.to_string()))?;
                let update = Update::PlayerMoved(PlayerMoved {
                    id: id.to_string(),
                    to_position: player.position + direction * self.settings.move_step,
                    request_time: created,
                });
                self.world.apply(&update)?;
                self.defer(Deferred::Broadcast(update));
            }
            Request::Speak(SpeakRequest { text }) => {
                let len = text.chars().count();
                if text.trim().is_empty() || len > self.settings.max_speech_length {
                    tracing::debug!("Ignoring speech of length {len} from {id}");
                    return Ok(());
                }
                let update = Update::PlayerSpoke(PlayerSpoke {
                    id: id.to_string(),
                    text,
                    spoken_at: self.clock.next(),
                });
                self.world.apply(&update)?;
                self.defer(Deferred::Broadcast(update));
            }
            Request::Connect(_) => {
                return Err(SyncError::ProtocolViolation(
                    "ConnectRequest after admission".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn drain_deferred(&self) -> Result<(), SyncError> {
        let _exclusive = self.drain_lock.lock().await;
        loop {
            let next = self
                .deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(item) = next else {
                return Ok(());
            };
            self.execute(item).await?;
        }
    }

    async fn execute(&self, item: Deferred) -> Result<(), SyncError> {
        match item {
            Deferred::Publish(update) => {
                self.world.apply(&update)?;
                self.broadcast(&update).await
            }
            Deferred::Broadcast(update) => self.broadcast(&update).await,
            Deferred::SyncWorld(id) => self.sync_world(&id).await,
        }
    }

    async fn sync_world(&self, id: &str) -> Result<(), SyncError> {
        let Some(session) = self.session(id) else {
            tracing::debug!("Skipping snapshot for departed {id}");
            return Ok(());
        };
        if session.state() != SessionState::Connecting {
            return Ok(());
        }
        let snapshot = Message::Update(Update::WorldStateSnapshot(self.world.snapshot()));
        let frame = encode_message_frame(&snapshot, &self.settings.frame)?;
        if let Err(e) = session.send_frame(&frame, self.settings.broadcast_timeout).await {
            session.close();
            return Err(e.into());
        }
        session.activate();
        tracing::debug!("Sent snapshot to {id}");
        Ok(())
    }

    /// Encodes `update` once and writes it to every active session.
    ///
    /// A recipient whose write fails or times out is closed; delivery to the
    /// rest continues and the failed IDs are reported.
    pub async fn broadcast(&self, update: &Update) -> Result<(), SyncError> {
        let frame = encode_message_frame(&Message::Update(update.clone()), &self.settings.frame)?;
        let mut failed = Vec::new();
        for session in self.active_sessions() {
            if let Err(e) = session.send_frame(&frame, self.settings.broadcast_timeout).await {
                tracing::warn!("Broadcast of {} to {} failed: {e}", update.kind(), session.player_id());
                session.close();
                failed.push(session.player_id().to_string());
            }
        }
        tracing::trace!("Broadcast {}", update.kind());
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Broadcast { failed })
        }
    }

    /// Ticks at the configured rate until `shutdown` turns `true`.
    ///
    /// Non-fatal tick errors are logged and forwarded to `errors`. A fatal
    /// one stops the loop and is returned.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        errors: mpsc::UnboundedSender<SyncError>,
    ) -> Result<(), SyncError> {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Tick loop running every {:?}", self.settings.tick_interval);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        if e.is_fatal() {
                            tracing::error!("Tick failed fatally: {e}");
                            return Err(e);
                        }
                        tracing::error!("Tick failed: {e}");
                        let _ = errors.send(e);
                    }
                }
            }
        }

        tracing::info!("Tick loop stopped");
        Ok(())
    }
}

async fn read_connect(reader: &mut BoxedReader, frame: &FrameConfig) -> Result<String, SyncError> {
    loop {
        match recv_message(reader, frame).await? {
            None => continue,
            Some(Message::Request(Request::Connect(connect))) => {
                if connect.id.trim().is_empty() {
                    return Err(SyncError::ProtocolViolation("empty player ID".to_string()));
                }
                return Ok(connect.id);
            }
            Some(other) => {
                return Err(SyncError::ProtocolViolation(format!(
                    "expected ConnectRequest, got {}",
                    other.kind()
                )));
            }
        }
    }
}
