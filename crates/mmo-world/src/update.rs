//! The closed set of world mutations.
//!
//! Every change to a [`World`](crate::World), on the server and on every
//! client, is one of these variants. Observers that apply the same sequence
//! end up with the same world.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::world::WorldSnapshot;

/// A single world mutation. The enum discriminant is the type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Update {
    /// A player joined or returned.
    AddPlayer(AddPlayer),
    /// A player left.
    RemovePlayer(RemovePlayer),
    /// A player's position changed.
    PlayerMoved(PlayerMoved),
    /// A player said something.
    PlayerSpoke(PlayerSpoke),
    /// Full replacement of the world, sent once to a newly admitted client.
    WorldStateSnapshot(WorldSnapshot),
}

/// Payload of [`Update::AddPlayer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddPlayer {
    /// Joining player.
    pub id: String,
    /// Where the player appears.
    pub position: DVec2,
}

/// Payload of [`Update::RemovePlayer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovePlayer {
    /// Leaving player.
    pub id: String,
}

/// Payload of [`Update::PlayerMoved`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerMoved {
    /// Moving player.
    pub id: String,
    /// Authoritative position after the move.
    pub to_position: DVec2,
    /// Creation time of the client request that caused the move, echoed so
    /// the mover can reconcile its predictions.
    pub request_time: Timestamp,
}

/// Payload of [`Update::PlayerSpoke`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSpoke {
    /// Speaking player.
    pub id: String,
    /// What was said.
    pub text: String,
    /// Server time the line was accepted.
    pub spoken_at: Timestamp,
}

impl Update {
    /// The player this update concerns, `None` for snapshots.
    pub fn player_id(&self) -> Option<&str> {
        match self {
            Self::AddPlayer(AddPlayer { id, .. })
            | Self::RemovePlayer(RemovePlayer { id })
            | Self::PlayerMoved(PlayerMoved { id, .. })
            | Self::PlayerSpoke(PlayerSpoke { id, .. }) => Some(id),
            Self::WorldStateSnapshot(_) => None,
        }
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddPlayer(_) => "AddPlayer",
            Self::RemovePlayer(_) => "RemovePlayer",
            Self::PlayerMoved(_) => "PlayerMoved",
            Self::PlayerSpoke(_) => "PlayerSpoke",
            Self::WorldStateSnapshot(_) => "WorldStateSnapshot",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::Player;

    fn all_variants() -> Vec<Update> {
        let mut snapshot = WorldSnapshot::default();
        snapshot
            .players
            .insert("bob".to_string(), Player::new("bob", DVec2::new(3.0, -1.0)));
        vec![
            Update::AddPlayer(AddPlayer {
                id: "alice".to_string(),
                position: DVec2::ZERO,
            }),
            Update::RemovePlayer(RemovePlayer {
                id: "alice".to_string(),
            }),
            Update::PlayerMoved(PlayerMoved {
                id: "alice".to_string(),
                to_position: DVec2::new(2.0, 0.0),
                request_time: Timestamp(42),
            }),
            Update::PlayerSpoke(PlayerSpoke {
                id: "alice".to_string(),
                text: "hello".to_string(),
                spoken_at: Timestamp(43),
            }),
            Update::WorldStateSnapshot(snapshot),
        ]
    }

    #[test]
    fn test_update_serializes_in_both_formats() {
        for update in all_variants() {
            let bytes = postcard::to_allocvec(&update).expect("serialize");
            let decoded: Update = postcard::from_bytes(&bytes).expect("deserialize");
            assert_eq!(update, decoded);

            let json = serde_json::to_string(&update).expect("json serialize");
            let from_json: Update = serde_json::from_str(&json).expect("json deserialize");
            assert_eq!(update, from_json);
        }
    }

    #[test]
    fn test_player_id_and_kind() {
        let variants = all_variants();
        let kinds: Vec<_> = variants.iter().map(Update::kind).collect();
        assert_eq!(
            kinds,
            ["AddPlayer", "RemovePlayer", "PlayerMoved", "PlayerSpoke", "WorldStateSnapshot"]
        );
        let ids: Vec<_> = variants.iter().map(|u| u.player_id()).collect();
        assert_eq!(ids[..4], [Some("alice"); 4]);
        assert_eq!(ids[4], None);
    }
}
