//! Client-side prediction: immediate local application of player intents.
//!
//! A [`Simulation`] is a re-runnable world mutation stamped with the time the
//! matching request was created. The [`PredictionEngine`] runs simulations as
//! soon as they are queued and keeps them until the server confirms them. On
//! an authoritative correction, simulations at or before the confirmed
//! request time are discarded and the newer ones are replayed on top of the
//! corrected state.

use std::collections::VecDeque;

use mmo_world::{Timestamp, World, WorldError};

/// A mutation of the local world that can be run more than once.
pub type Effect = Box<dyn Fn(&World) -> Result<(), WorldError> + Send + Sync>;

/// One locally predicted effect that the server has not yet confirmed.
pub struct Simulation {
    created: Timestamp,
    effect: Effect,
}

impl Simulation {
    pub fn new(
        created: Timestamp,
        effect: impl Fn(&World) -> Result<(), WorldError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            created,
            effect: Box::new(effect),
        }
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn run(&self, world: &World) -> Result<(), WorldError> {
        (self.effect)(world)
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation").field("created", &self.created).finish_non_exhaustive()
    }
}

/// What [`PredictionEngine::reconcile`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    /// Simulations discarded because the server already accounted for them.
    pub superseded: usize,
    /// Simulations put back in the queue to be replayed.
    pub replayed: usize,
}

/// Ordered store of pending simulations.
#[derive(Debug, Default)]
pub struct PredictionEngine {
    /// Not yet run, oldest first.
    queued: VecDeque<Simulation>,
    /// Run and awaiting confirmation, oldest first.
    applied: Vec<Simulation>,
}

impl PredictionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, simulation: Simulation) {
        self.queued.push_back(simulation);
    }

    /// Runs every queued simulation in order and moves it to the applied
    /// list. A simulation whose effect fails is dropped. Returns how many
    /// ran successfully.
    pub fn apply_pending(&mut self, world: &World) -> usize {
        let mut ran = 0;
        while let Some(simulation) = self.queued.pop_front() {
            match simulation.run(world) {
                Ok(()) => {
                    ran += 1;
                    self.applied.push(simulation);
                }
                Err(e) => tracing::debug!("Dropping prediction {:?}: {e}", simulation.created),
            }
        }
        ran
    }

    /// Discards every simulation created at or before `request_time` and
    /// queues the newer applied ones, in their original order, ahead of
    /// anything not yet run. The applied list is empty afterwards.
    pub fn reconcile(&mut self, request_time: Timestamp) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        let before = self.queued.len();
        self.queued.retain(|s| s.created > request_time);
        outcome.superseded += before - self.queued.len();

        for simulation in std::mem::take(&mut self.applied).into_iter().rev() {
            if simulation.created > request_time {
                outcome.replayed += 1;
                self.queued.push_front(simulation);
            } else {
                outcome.superseded += 1;
            }
        }
        outcome
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn applied_len(&self) -> usize {
        self.applied.len()
    }

    /// Creation times of every pending simulation, queued first.
    pub fn pending_times(&self) -> Vec<Timestamp> {
        self.queued
            .iter()
            .chain(self.applied.iter())
            .map(Simulation::created)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmo_world::{AddPlayer, DVec2, PlayerMoved, Update};

    fn world_with(id: &str, x: f64) -> World {
        let world = World::new();
        world
            .apply(&Update::AddPlayer(AddPlayer {
                id: id.to_string(),
                position: DVec2::new(x, 0.0),
            }))
            .unwrap();
        world
    }

    fn step_right(created: u64) -> Simulation {
        Simulation::new(Timestamp(created), move |world| {
            let me = world
                .get_active("me")
                .ok_or_else(|| WorldError::NotFoundOrInactive("me".to_string()))?;
            world.apply(&Update::PlayerMoved(PlayerMoved {
                id: "me".to_string(),
                to_position: me.position + DVec2::new(2.0, 0.0),
                request_time: Timestamp(created),
            }))
        })
    }

    fn x_of(world: &World) -> f64 {
        world.get("me").unwrap().position.x
    }

    #[test]
    fn test_apply_pending_runs_in_order() {
        let world = world_with("me", 0.0);
        let mut engine = PredictionEngine::new();
        engine.queue(step_right(1));
        engine.queue(step_right(2));

        assert_eq!(engine.apply_pending(&world), 2);
        assert_eq!(x_of(&world), 4.0);
        assert_eq!(engine.queued_len(), 0);
        assert_eq!(engine.applied_len(), 2);
        assert_eq!(engine.apply_pending(&world), 0);
    }

    #[test]
    fn test_reconcile_keeps_only_newer_simulations() {
        let world = world_with("me", 0.0);
        let mut engine = PredictionEngine::new();
        for t in [1, 2, 3] {
            engine.queue(step_right(t));
        }
        engine.apply_pending(&world);
        assert_eq!(x_of(&world), 6.0);

        // Server confirms the move created at t=2: two steps from 0.
        world
            .apply(&Update::PlayerMoved(PlayerMoved {
                id: "me".to_string(),
                to_position: DVec2::new(4.0, 0.0),
                request_time: Timestamp(2),
            }))
            .unwrap();
        let outcome = engine.reconcile(Timestamp(2));

        assert_eq!(outcome, ReconcileOutcome { superseded: 2, replayed: 1 });
        assert_eq!(engine.applied_len(), 0);
        assert_eq!(engine.pending_times(), vec![Timestamp(3)]);

        engine.apply_pending(&world);
        assert_eq!(x_of(&world), 6.0);
        assert_eq!(engine.pending_times(), vec![Timestamp(3)]);
    }

    #[test]
    fn test_reconcile_drops_queued_simulations_already_confirmed() {
        let world = world_with("me", 0.0);
        let mut engine = PredictionEngine::new();
        engine.queue(step_right(1));
        engine.apply_pending(&world);
        engine.queue(step_right(2));
        engine.queue(step_right(3));

        let outcome = engine.reconcile(Timestamp(2));
        assert_eq!(outcome, ReconcileOutcome { superseded: 2, replayed: 0 });
        assert_eq!(engine.pending_times(), vec![Timestamp(3)]);
    }

    #[test]
    fn test_replayed_simulations_precede_unrun_ones() {
        let world = world_with("me", 0.0);
        let mut engine = PredictionEngine::new();
        for t in [1, 2, 3] {
            engine.queue(step_right(t));
        }
        engine.apply_pending(&world);
        engine.queue(step_right(4));

        engine.reconcile(Timestamp(1));
        assert_eq!(
            engine.pending_times(),
            vec![Timestamp(2), Timestamp(3), Timestamp(4)]
        );
    }

    #[test]
    fn test_failing_simulation_is_dropped() {
        let world = World::new();
        let mut engine = PredictionEngine::new();
        engine.queue(step_right(1));
        assert_eq!(engine.apply_pending(&world), 0);
        assert_eq!(engine.applied_len(), 0);
    }
}
