//! Error taxonomy shared by the server session machinery and the client.

use mmo_net::WireError;
use mmo_world::WorldError;

/// Everything that can go wrong while synchronizing a world.
///
/// Only [`SyncError::Fatal`] ends a process. The server never wraps a
/// session-level fault in it; a client does for transport loss and for a
/// rejected admission.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The peer sent something the protocol does not allow at this point.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Another active session already holds the requested player ID.
    #[error("player {0:?} is already connected")]
    AdmissionConflict(String),

    /// An update referenced a player in the wrong lifecycle state.
    #[error("state invariant violated: {0}")]
    StateInvariant(#[from] WorldError),

    /// Reading, writing, or decoding on a session stream failed.
    #[error("transport failure: {0}")]
    Transport(#[from] WireError),

    /// Some recipients of a broadcast could not be written to. They have
    /// been closed; every other recipient got the update.
    #[error("broadcast failed for {}", .failed.join(", "))]
    Broadcast { failed: Vec<String> },

    /// The server refused this client's admission.
    #[error("admission rejected: {0}")]
    Rejected(String),

    /// The session ended.
    #[error("session closed: {0}")]
    Closed(String),

    #[error("fatal: {0}")]
    Fatal(Box<SyncError>),
}

impl SyncError {
    /// Tags this error as process-fatal. Tagging twice is a no-op.
    pub fn fatal(self) -> Self {
        match self {
            Self::Fatal(_) => self,
            other => Self::Fatal(Box::new(other)),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
