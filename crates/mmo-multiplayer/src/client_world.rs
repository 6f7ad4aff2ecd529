//! The participant's local, speculative copy of the world.
//!
//! [`GameWorld`] is the boundary the presentation layer talks to: it turns
//! local intents into requests (predicting their effect immediately), applies
//! authoritative updates as they arrive, and exposes a read-only view for
//! rendering. It is owned by the render loop; nothing else mutates it.

use std::time::Duration;

use mmo_config::Config;
use mmo_net::{ClientEvent, MoveRequest, Request, SpeakRequest};
use mmo_world::{
    DVec2, MonotonicClock, Player, PlayerMoved, Timestamp, Update, World, WorldError,
    WorldSnapshot,
};

use crate::error::SyncError;
use crate::prediction::{PredictionEngine, ReconcileOutcome, Simulation};

/// Something the local player wants to do.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalIntent {
    Move(DVec2),
    Speak(String),
}

pub struct GameWorld {
    world: World,
    engine: PredictionEngine,
    local_id: String,
    clock: MonotonicClock,
    move_step: f64,
    speech_ttl: Duration,
}

impl GameWorld {
    pub fn new(local_id: impl Into<String>, move_step: f64, speech_ttl: Duration) -> Self {
        Self {
            world: World::new(),
            engine: PredictionEngine::new(),
            local_id: local_id.into(),
            clock: MonotonicClock::new(),
            move_step,
            speech_ttl,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.client.player_id.clone(),
            config.world.move_step,
            config.world.speech_ttl(),
        )
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_player(&self) -> Option<Player> {
        self.world.get_active(&self.local_id)
    }

    /// Number of predictions not yet confirmed by the server.
    pub fn pending_predictions(&self) -> usize {
        self.engine.queued_len() + self.engine.applied_len()
    }

    /// Applies an authoritative update.
    ///
    /// Every `PlayerMoved`, whoever moved, also reconciles pending
    /// predictions against its request time.
    pub fn apply_update(&mut self, update: &Update) -> Result<(), WorldError> {
        self.world.apply(update)?;
        if let Update::PlayerMoved(PlayerMoved { request_time, .. }) = update {
            let ReconcileOutcome { superseded, replayed } = self.engine.reconcile(*request_time);
            if superseded + replayed > 0 {
                tracing::trace!("Reconciled at {request_time:?}: {superseded} superseded, {replayed} replayed");
            }
        }
        Ok(())
    }

    /// Queues a local effect to run on the next [`frame`](Self::frame).
    pub fn queue_local_prediction(
        &mut self,
        effect: impl Fn(&World) -> Result<(), WorldError> + Send + Sync + 'static,
        created: Timestamp,
    ) {
        self.engine.queue(Simulation::new(created, effect));
    }

    /// Runs pending predictions. Call once per rendered frame.
    pub fn frame(&mut self) -> usize {
        self.engine.apply_pending(&self.world)
    }

    /// Read-only copy of the active players as currently predicted.
    pub fn current_world_view(&self) -> WorldSnapshot {
        self.world.snapshot()
    }

    /// Speech of `id` that has not yet expired at `now`.
    pub fn visible_speech(&self, id: &str, now: Timestamp) -> Vec<String> {
        self.world
            .get_active(id)
            .map(|p| p.recent_speech(now, self.speech_ttl).map(|e| e.text.clone()).collect())
            .unwrap_or_default()
    }

    /// Turns a local intent into the request to send, predicting moves
    /// locally. Returns `None` for intents that would be ignored anyway.
    pub fn local_intent(&mut self, intent: LocalIntent) -> Option<Request> {
        match intent {
            LocalIntent::Move(direction) => {
                if direction == DVec2::ZERO || !direction.is_finite() {
                    return None;
                }
                let created = self.clock.next();
                let id = self.local_id.clone();
                let step = self.move_step;
                self.queue_local_prediction(
                    move |world| {
                        let me = world
                            .get_active(&id)
                            .ok_or_else(|| WorldError::NotFoundOrInactive(id.clone()))?;
                        world.apply(&Update::PlayerMoved(PlayerMoved {
                            id: id.clone(),
                            to_position: me.position + direction * step,
                            request_time: created,
                        }))
                    },
                    created,
                );
                Some(Request::Move(MoveRequest { direction, created }))
            }
            LocalIntent::Speak(text) => {
                if text.trim().is_empty() {
                    return None;
                }
                Some(Request::Speak(SpeakRequest { text }))
            }
        }
    }

    /// Handles one event from the connection.
    ///
    /// Updates that do not fit the local world are logged and skipped; a
    /// snapshot will have made them redundant. Rejection and connection
    /// loss are fatal.
    pub fn handle_event(&mut self, event: ClientEvent) -> Result<(), SyncError> {
        match event {
            ClientEvent::Update(update) => {
                if let Err(e) = self.apply_update(&update) {
                    tracing::debug!("Skipping {}: {e}", update.kind());
                }
                Ok(())
            }
            ClientEvent::Rejected(reason) => Err(SyncError::Rejected(reason).fatal()),
            ClientEvent::Closed(reason) => Err(SyncError::Closed(reason).fatal()),
        }
    }
}
