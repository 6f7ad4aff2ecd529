//! Server-side handle for one admitted participant.
//!
//! A session is created once the first message on a stream names a free
//! player ID. From then on its read task only enqueues requests; the tick
//! task drains them and is the only writer of the world.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use mmo_net::{BoxedWriter, MoveRequest, Request, WireError, write_encoded};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Admitted, waiting for its world snapshot. Receives no broadcasts.
    Connecting,
    /// Snapshot delivered; receives every broadcast and has its requests
    /// processed each tick.
    Active,
    /// Terminal. The read task exits and the player is removed.
    Closed,
}

/// Producer half of a session's bounded request queue. Sending waits for
/// free capacity.
pub type RequestSender = mpsc::Sender<Request>;

struct Inbox {
    requests: mpsc::Receiver<Request>,
    capacity: usize,
    /// Most recent move accepted for this session, used to drop replays.
    last_move: Option<MoveRequest>,
}

pub struct Session {
    player_id: String,
    peer: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    inbox: Mutex<Inbox>,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// Creates a session in [`SessionState::Connecting`] with a request
    /// queue of `capacity` (at least one).
    pub fn new(
        player_id: impl Into<String>,
        peer: impl Into<String>,
        writer: BoxedWriter,
        capacity: usize,
    ) -> (Self, RequestSender) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (state, _) = watch::channel(SessionState::Connecting);
        let session = Self {
            player_id: player_id.into(),
            peer: peer.into(),
            writer: tokio::sync::Mutex::new(writer),
            inbox: Mutex::new(Inbox {
                requests: rx,
                capacity,
                last_move: None,
            }),
            state,
        };
        (session, tx)
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// `Connecting -> Active`. Returns `false` if the session was not
    /// connecting.
    pub fn activate(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Moves the session to [`SessionState::Closed`], waking its read task.
    /// Idempotent.
    pub fn close(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    // --- Request queue ---

    /// Removes every queued request, oldest first. Takes at most one queue's
    /// worth so a producer refilling the queue cannot stall the tick.
    pub fn drain_requests(&self) -> Vec<Request> {
        let mut inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = inbox.capacity;
        let mut drained = Vec::new();
        while drained.len() < limit {
            match inbox.requests.try_recv() {
                Ok(request) => drained.push(request),
                Err(_) => break,
            }
        }
        drained
    }

    /// Number of requests waiting in the queue.
    pub fn queued_requests(&self) -> usize {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .len()
    }

    /// Records `request` as the latest move. Returns `false` when it repeats
    /// the previous move exactly, which marks it as a replay to drop.
    pub fn record_move(&self, request: &MoveRequest) -> bool {
        let mut inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        if inbox.last_move.as_ref() == Some(request) {
            return false;
        }
        inbox.last_move = Some(request.clone());
        true
    }

    // --- Writing ---

    /// Writes a pre-encoded frame, giving up after `deadline`. A timed-out
    /// write may leave a partial frame behind, so the caller must close the
    /// session on error.
    pub async fn send_frame(&self, frame: &[u8], deadline: Duration) -> Result<(), WireError> {
        let write = async {
            let mut writer = self.writer.lock().await;
            write_encoded(&mut *writer, frame).await
        };
        match tokio::time::timeout(deadline, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WireError::TimedOut(deadline)),
        }
    }

    /// Closes the write half of the stream.
    pub async fn shutdown_writer(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("player_id", &self.player_id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmo_net::{FrameConfig, Message, SessionStream, SpeakRequest, recv_message};
    use mmo_world::{DVec2, Timestamp};

    fn speak(text: &str) -> Request {
        Request::Speak(SpeakRequest {
            text: text.to_string(),
        })
    }

    fn session(capacity: usize) -> (Session, RequestSender, SessionStream) {
        let (server, client) = SessionStream::in_memory_pair(1024);
        let (session, tx) = Session::new("alice", server.peer, server.writer, capacity);
        (session, tx, client)
    }

    #[test]
    fn test_state_transitions() {
        let (session, _tx, _client) = session(4);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.is_active());

        assert!(session.activate());
        assert!(session.is_active());
        assert!(!session.activate());

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.activate());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (session, _tx, _client) = session(4);
        let session = std::sync::Arc::new(session);
        let waiter = {
            let session = std::sync::Arc::clone(&session);
            tokio::spawn(async move { session.closed().await })
        };
        session.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let (session, tx, _client) = session(8);
        for text in ["a", "b", "c"] {
            tx.send(speak(text)).await.unwrap();
        }
        assert_eq!(session.queued_requests(), 3);
        assert_eq!(session.drain_requests(), vec![speak("a"), speak("b"), speak("c")]);
        assert!(session.drain_requests().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producer() {
        let (session, tx, _client) = session(2);
        tx.send(speak("1")).await.unwrap();
        tx.send(speak("2")).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(speak("3"))).await;
        assert!(blocked.is_err(), "third send should wait for capacity");

        let producer = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(speak("3")).await.unwrap() }
        });
        tokio::task::yield_now().await;
        assert_eq!(session.drain_requests().len(), 2);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.drain_requests(), vec![speak("3")]);
    }

    #[test]
    fn test_identical_move_is_a_replay() {
        let (session, _tx, _client) = session(4);
        let first = MoveRequest {
            direction: DVec2::X,
            created: Timestamp(10),
        };
        let second = MoveRequest {
            direction: DVec2::X,
            created: Timestamp(11),
        };
        assert!(session.record_move(&first));
        assert!(!session.record_move(&first));
        assert!(session.record_move(&second));
    }

    #[tokio::test]
    async fn test_send_frame_reaches_peer() {
        let (session, _tx, mut client) = session(4);
        let config = FrameConfig::default();
        let msg = Message::Request(speak("hi"));
        let frame = mmo_net::encode_message_frame(&msg, &config).unwrap();
        session.send_frame(&frame, Duration::from_secs(1)).await.unwrap();
        assert_eq!(recv_message(&mut client.reader, &config).await.unwrap(), Some(msg));
    }

    #[tokio::test]
    async fn test_send_frame_times_out_when_peer_stalls() {
        let (session, _tx, _client) = session(4);
        // 4 KiB never fits into the 1 KiB duplex buffer nobody drains.
        let frame = vec![0u8; 4096];
        let err = session
            .send_frame(&frame, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::TimedOut(_)));
    }
}
