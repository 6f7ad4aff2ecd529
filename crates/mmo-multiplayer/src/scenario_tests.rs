//! End-to-end session scenarios over in-memory streams.

use std::sync::Arc;
use std::time::Duration;

use mmo_net::{
    ClientNetConfig, ConnectRequest, FrameConfig, GameClient, Message, MoveRequest, Request,
    SessionStream, SpeakRequest, recv_message, send_message,
};
use mmo_world::{DVec2, PlayerSpoke, RemovePlayer, Timestamp, Update, World};

use crate::client_world::{GameWorld, LocalIntent};
use crate::error::SyncError;
use crate::update_manager::{Deferred, ServerSettings, UpdateManager};

const WAIT: Duration = Duration::from_secs(2);

fn manager() -> Arc<UpdateManager> {
    Arc::new(UpdateManager::new(ServerSettings {
        handshake_timeout: Duration::from_secs(1),
        broadcast_timeout: Duration::from_millis(100),
        spawn_position: DVec2::ZERO,
        move_step: 2.0,
        ..ServerSettings::default()
    }))
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// The participant end of an in-memory session.
struct Peer {
    id: String,
    stream: SessionStream,
    frame: FrameConfig,
}

impl Peer {
    async fn send(&mut self, request: Request) {
        send_message(&mut self.stream.writer, &Message::Request(request), &self.frame)
            .await
            .unwrap();
    }

    async fn move_by(&mut self, direction: DVec2, created: u64) {
        self.send(Request::Move(MoveRequest {
            direction,
            created: Timestamp(created),
        }))
        .await;
    }

    async fn next_message(&mut self) -> Message {
        loop {
            let next = tokio::time::timeout(WAIT, recv_message(&mut self.stream.reader, &self.frame))
                .await
                .unwrap_or_else(|_| panic!("{} got nothing", self.id))
                .unwrap();
            if let Some(msg) = next {
                return msg;
            }
        }
    }

    async fn next_update(&mut self) -> Update {
        match self.next_message().await {
            Message::Update(update) => update,
            other => panic!("{} expected an update, got {other:?}", self.id),
        }
    }

    /// `None` if nothing arrives within `quiet`.
    async fn next_within(&mut self, quiet: Duration) -> Option<Message> {
        tokio::time::timeout(quiet, recv_message(&mut self.stream.reader, &self.frame))
            .await
            .ok()
            .map(|r| r.unwrap())
            .flatten()
    }
}

/// Opens a session for `id` and starts serving it, without ticking.
async fn connect_with_buffer(manager: &Arc<UpdateManager>, id: &str, buffer: usize) -> Peer {
    let (mut client, server) = SessionStream::in_memory_pair(buffer);
    let frame = FrameConfig::default();
    let hello = Message::Request(Request::Connect(ConnectRequest { id: id.to_string() }));
    send_message(&mut client.writer, &hello, &frame).await.unwrap();

    let serving = Arc::clone(manager);
    tokio::spawn(async move { serving.run_session(server).await });
    Peer {
        id: id.to_string(),
        stream: client,
        frame,
    }
}

async fn connect(manager: &Arc<UpdateManager>, id: &str) -> Peer {
    connect_with_buffer(manager, id, 1 << 16).await
}

/// Connects `id` and ticks once so the player is published and synced.
async fn join(manager: &Arc<UpdateManager>, id: &str) -> Peer {
    let peer = connect(manager, id).await;
    wait_until("admission", || manager.session(id).is_some()).await;
    manager.tick().await.unwrap();
    peer
}

fn snapshot_ids(update: &Update) -> Vec<String> {
    match update {
        Update::WorldStateSnapshot(snapshot) => snapshot.ids().map(str::to_string).collect(),
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_newcomer_snapshot_lists_every_active_player() {
    let manager = manager();
    let _alice = join(&manager, "alice").await;
    let _bob = join(&manager, "bob").await;
    let mut carol = join(&manager, "carol").await;

    let first = carol.next_update().await;
    assert_eq!(snapshot_ids(&first), ["alice", "bob", "carol"]);
    if let Update::WorldStateSnapshot(snapshot) = first {
        assert!(snapshot.players.values().all(|p| p.active));
    }
}

#[tokio::test]
async fn test_duplicate_id_is_rejected_without_disturbing_holder() {
    let manager = manager();
    let mut alice = join(&manager, "alice").await;
    alice.next_update().await;

    let (mut imposter, server) = SessionStream::in_memory_pair(1024);
    let frame = FrameConfig::default();
    let hello = Message::Request(Request::Connect(ConnectRequest {
        id: "alice".to_string(),
    }));
    send_message(&mut imposter.writer, &hello, &frame).await.unwrap();

    let err = manager.admit(server).await.err().unwrap();
    assert!(matches!(err, SyncError::AdmissionConflict(ref id) if id == "alice"));

    let reply = recv_message(&mut imposter.reader, &frame).await.unwrap();
    assert!(matches!(reply, Some(Message::Error(_))));
    let eof = recv_message(&mut imposter.reader, &frame).await.unwrap_err();
    assert!(eof.is_closed());

    assert_eq!(manager.session_count(), 1);
    alice
        .send(Request::Speak(SpeakRequest {
            text: "still here".to_string(),
        }))
        .await;
    wait_until("queued speech", || {
        manager.session("alice").is_some_and(|s| s.queued_requests() == 1)
    })
    .await;
    manager.tick().await.unwrap();
    assert!(matches!(alice.next_update().await, Update::PlayerSpoke(PlayerSpoke { ref text, .. }) if text == "still here"));
}

#[tokio::test]
async fn test_reconnect_reactivates_previous_record() {
    let manager = manager();
    let mut alice = join(&manager, "alice").await;
    alice.next_update().await;
    alice.move_by(DVec2::X, 1).await;
    wait_until("queued move", || {
        manager.session("alice").is_some_and(|s| s.queued_requests() == 1)
    })
    .await;
    manager.tick().await.unwrap();
    assert_eq!(manager.world().get("alice").unwrap().position.x, 2.0);

    drop(alice);
    wait_until("disconnect", || manager.session_count() == 0).await;
    manager.tick().await.unwrap();
    assert!(!manager.world().is_active("alice"));
    assert_eq!(manager.world().player_count(), 1);

    let mut alice = join(&manager, "alice").await;
    assert_eq!(snapshot_ids(&alice.next_update().await), ["alice"]);
    let record = manager.world().get_active("alice").unwrap();
    assert_eq!(record.position, DVec2::ZERO);
    assert_eq!(manager.world().player_count(), 1);
}

#[tokio::test]
async fn test_two_moves_in_one_tick_apply_twice() {
    let manager = manager();
    let mut alice = join(&manager, "alice").await;
    alice.next_update().await;

    alice.move_by(DVec2::new(1.0, 0.0), 10).await;
    alice.move_by(DVec2::new(1.0, 0.0), 11).await;
    wait_until("both moves queued", || {
        manager.session("alice").is_some_and(|s| s.queued_requests() == 2)
    })
    .await;
    manager.tick().await.unwrap();

    assert_eq!(manager.world().get("alice").unwrap().position, DVec2::new(4.0, 0.0));
    for (x, created) in [(2.0, 10), (4.0, 11)] {
        match alice.next_update().await {
            Update::PlayerMoved(moved) => {
                assert_eq!(moved.to_position, DVec2::new(x, 0.0));
                assert_eq!(moved.request_time, Timestamp(created));
            }
            other => panic!("expected move, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_read_failure_broadcasts_exactly_one_removal() {
    let manager = manager();
    let alice = join(&manager, "alice").await;
    let mut bob = join(&manager, "bob").await;
    assert_eq!(snapshot_ids(&bob.next_update().await), ["alice", "bob"]);

    drop(alice);
    wait_until("disconnect", || manager.session_count() == 1).await;
    manager.tick().await.unwrap();
    assert_eq!(
        bob.next_update().await,
        Update::RemovePlayer(RemovePlayer {
            id: "alice".to_string()
        })
    );

    manager.tick().await.unwrap();
    assert!(bob.next_within(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_observers_converge_on_one_update_order() {
    let manager = manager();
    let ids = ["p0", "p1", "p2"];
    let mut peers = Vec::new();
    for id in ids {
        peers.push(join(&manager, id).await);
    }

    // Replay the join phase: p_i saw its snapshot plus every later join.
    let mut replicas = Vec::new();
    for (i, peer) in peers.iter_mut().enumerate() {
        let replica = World::new();
        for _ in 0..(ids.len() - i) {
            replica.apply(&peer.next_update().await).unwrap();
        }
        replicas.push(replica);
    }

    let mut readers = Vec::new();
    let mut writers = Vec::new();
    for ((i, peer), replica) in peers.into_iter().enumerate().zip(replicas) {
        let Peer { id, stream, frame } = peer;
        let SessionStream {
            mut reader, writer, ..
        } = stream;

        let read_frame = frame.clone();
        readers.push(tokio::spawn(async move {
            let mut log = Vec::new();
            while let Ok(next) =
                tokio::time::timeout(Duration::from_millis(500), recv_message(&mut reader, &read_frame)).await
            {
                if let Some(Message::Update(update)) = next.unwrap() {
                    replica.apply(&update).unwrap();
                    log.push(update);
                }
            }
            (replica.snapshot(), log)
        }));

        writers.push(tokio::spawn(async move {
            let mut peer = Peer {
                id,
                stream: SessionStream::new(Box::new(tokio::io::empty()), writer, "writer"),
                frame,
            };
            for n in 0..5u64 {
                let direction = if n % 2 == 0 { DVec2::X } else { DVec2::Y };
                peer.move_by(direction * (i as f64 + 1.0), 100 + n).await;
            }
            for n in 0..2 {
                peer.send(Request::Speak(SpeakRequest {
                    text: format!("{} says {n}", peer.id),
                }))
                .await;
            }
            peer
        }));
    }

    let mut senders = Vec::new();
    for writer in writers {
        senders.push(writer.await.unwrap());
    }
    for _ in 0..10 {
        manager.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let authoritative = manager.world().snapshot();
    let mut logs = Vec::new();
    for reader in readers {
        let (snapshot, log) = reader.await.unwrap();
        assert_eq!(snapshot, authoritative);
        logs.push(log);
    }
    assert!(logs.windows(2).all(|w| w[0] == w[1]));
    let moves = logs[0].iter().filter(|u| matches!(u, Update::PlayerMoved(_))).count();
    let speech = logs[0].iter().filter(|u| matches!(u, Update::PlayerSpoke(_))).count();
    assert_eq!((moves, speech), (15, 6));
    drop(senders);
}

#[tokio::test]
async fn test_stalled_recipient_is_dropped_while_others_keep_receiving() {
    let manager = manager();
    let mut alice = connect_with_buffer(&manager, "alice", 256).await;
    wait_until("admission", || manager.session("alice").is_some()).await;
    manager.tick().await.unwrap();
    alice.next_update().await;

    let mut bob = join(&manager, "bob").await;
    bob.next_update().await;

    // Alice stops reading; her 256-byte pipe fills after a few updates.
    let mut delivered = 0;
    let mut failed = None;
    for n in 0..50u64 {
        manager.defer(Deferred::Broadcast(Update::PlayerSpoke(PlayerSpoke {
            id: "bob".to_string(),
            text: "x".repeat(100),
            spoken_at: Timestamp(n),
        })));
        delivered += 1;
        if let Err(e) = manager.tick().await {
            failed = Some(e);
            break;
        }
    }
    match failed {
        Some(SyncError::Broadcast { failed }) => assert_eq!(failed, ["alice"]),
        other => panic!("expected a broadcast failure, got {other:?}"),
    }

    for n in 0..delivered {
        match bob.next_update().await {
            Update::PlayerSpoke(spoke) => assert_eq!(spoke.spoken_at, Timestamp(n)),
            other => panic!("expected speech, got {other:?}"),
        }
    }

    wait_until("stalled session removed", || manager.session_count() == 1).await;
    manager.tick().await.unwrap();
    assert_eq!(
        bob.next_update().await,
        Update::RemovePlayer(RemovePlayer {
            id: "alice".to_string()
        })
    );
}

#[tokio::test]
async fn test_client_prediction_matches_server() {
    let manager = manager();
    let (client_side, server_side) = SessionStream::in_memory_pair(1 << 16);
    let serving = Arc::clone(&manager);
    tokio::spawn(async move { serving.run_session(server_side).await });

    let config = ClientNetConfig {
        heartbeat_interval: Duration::from_millis(10),
        ..ClientNetConfig::default()
    };
    let (client, mut events) = GameClient::connect(client_side, "alice", config).await.unwrap();
    let mut game = GameWorld::new("alice", 2.0, Duration::from_secs(5));

    wait_until("admission", || manager.session("alice").is_some()).await;
    manager.tick().await.unwrap();
    game.handle_event(events.recv().await.unwrap()).unwrap();
    assert!(game.local_player().is_some());

    let request = game.local_intent(LocalIntent::Move(DVec2::X)).unwrap();
    client.send(request).await.unwrap();
    game.frame();
    assert_eq!(game.local_player().unwrap().position.x, 2.0);
    assert_eq!(game.pending_predictions(), 1);

    wait_until("queued move", || {
        manager.session("alice").is_some_and(|s| s.queued_requests() == 1)
    })
    .await;
    manager.tick().await.unwrap();
    game.handle_event(events.recv().await.unwrap()).unwrap();

    assert_eq!(game.local_player().unwrap().position.x, 2.0);
    assert_eq!(game.pending_predictions(), 0);
    assert_eq!(game.current_world_view(), manager.world().snapshot());

    client.disconnect().await;
    wait_until("disconnect", || manager.session_count() == 0).await;
}
