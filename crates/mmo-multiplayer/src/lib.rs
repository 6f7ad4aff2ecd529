//! Server-authoritative state sync: session admission, the tick loop and
//! ordered broadcast on the server side, prediction and reconciliation on
//! the participant side.

pub mod client_world;
pub mod error;
pub mod prediction;
pub mod server;
pub mod session;
pub mod update_manager;

#[cfg(test)]
mod scenario_tests;

pub use client_world::{GameWorld, LocalIntent};
pub use error::SyncError;
pub use prediction::{Effect, PredictionEngine, ReconcileOutcome, Simulation};
pub use server::GameServer;
pub use session::{RequestSender, Session, SessionState};
pub use update_manager::{AdmittedSession, Deferred, ServerSettings, UpdateManager};
