//! Shared world model: players, the closed set of world updates, and the
//! lock-guarded store both the authoritative server and every client apply
//! them to.

pub mod clock;
pub mod player;
pub mod update;
pub mod world;

pub use clock::{MonotonicClock, Timestamp};
pub use glam::DVec2;
pub use player::{Player, SPEECH_CAPACITY, SpeechEntry};
pub use update::{AddPlayer, PlayerMoved, PlayerSpoke, RemovePlayer, Update};
pub use world::{World, WorldError, WorldSnapshot};
