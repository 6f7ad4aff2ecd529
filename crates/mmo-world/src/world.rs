//! The lock-guarded player store.
//!
//! A [`World`] is mutated only through [`World::apply`], one [`Update`] at a
//! time. Reads hand out value copies so no caller ever holds the lock across
//! an await point.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::player::{Player, SpeechEntry};
use crate::update::{AddPlayer, PlayerMoved, PlayerSpoke, RemovePlayer, Update};

/// Rejected world mutations. The world is unchanged when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("player {0:?} is already active")]
    AlreadyActive(String),
    #[error("player {0:?} does not exist or is inactive")]
    NotFoundOrInactive(String),
}

/// Serializable copy of the active players, keyed by ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub players: BTreeMap<String, Player>,
}

impl WorldSnapshot {
    /// IDs in the snapshot, in key order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.players.keys().map(String::as_str)
    }
}

/// Map of player ID to player, shared between readers and a single writer.
#[derive(Debug, Default)]
pub struct World {
    players: RwLock<BTreeMap<String, Player>>,
}

impl World {
    /// An empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// A world holding exactly the players in `snapshot`.
    pub fn from_snapshot(snapshot: WorldSnapshot) -> Self {
        Self {
            players: RwLock::new(snapshot.players),
        }
    }

    // A panic while holding the lock cannot leave a half-applied update:
    // every arm validates before it writes.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Player>> {
        self.players.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Player>> {
        self.players.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one update.
    ///
    /// Everything except `AddPlayer` and `WorldStateSnapshot` requires the
    /// referenced player to exist and be active. `AddPlayer` for an inactive
    /// player replaces the stale record with a fresh one at the given
    /// position, dropping its old speech.
    pub fn apply(&self, update: &Update) -> Result<(), WorldError> {
        let mut players = self.write();
        match update {
            Update::AddPlayer(AddPlayer { id, position }) => {
                if players.get(id).is_some_and(|p| p.active) {
                    return Err(WorldError::AlreadyActive(id.clone()));
                }
                players.insert(id.clone(), Player::new(id.clone(), *position));
            }
            Update::RemovePlayer(RemovePlayer { id }) => {
                active_mut(&mut players, id)?.active = false;
            }
            Update::PlayerMoved(PlayerMoved { id, to_position, .. }) => {
                active_mut(&mut players, id)?.position = *to_position;
            }
            Update::PlayerSpoke(PlayerSpoke { id, text, spoken_at }) => {
                active_mut(&mut players, id)?.push_speech(SpeechEntry {
                    text: text.clone(),
                    spoken_at: *spoken_at,
                });
            }
            Update::WorldStateSnapshot(snapshot) => {
                *players = snapshot.players.clone();
            }
        }
        Ok(())
    }

    /// Copy of a player record, active or not.
    pub fn get(&self, id: &str) -> Option<Player> {
        self.read().get(id).cloned()
    }

    /// Copy of a player record if the player is active.
    pub fn get_active(&self, id: &str) -> Option<Player> {
        self.read().get(id).filter(|p| p.active).cloned()
    }

    /// Whether `id` names an active player.
    pub fn is_active(&self, id: &str) -> bool {
        self.read().get(id).is_some_and(|p| p.active)
    }

    /// Copies of all active players, ordered by ID.
    pub fn active_players(&self) -> Vec<Player> {
        self.read().values().filter(|p| p.active).cloned().collect()
    }

    /// The active players as a snapshot payload.
    pub fn snapshot(&self) -> WorldSnapshot {
        let players = self
            .read()
            .iter()
            .filter(|(_, p)| p.active)
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();
        WorldSnapshot { players }
    }

    /// Number of records, including inactive ones.
    pub fn player_count(&self) -> usize {
        self.read().len()
    }
}

fn active_mut<'a>(
    players: &'a mut BTreeMap<String, Player>,
    id: &str,
) -> Result<&'a mut Player, WorldError> {
    players
        .get_mut(id)
        .filter(|p| p.active)
        .ok_or_else(|| WorldError::NotFoundOrInactive(id.to_string()))
}
