//! Accept loop: turns transport session streams into served sessions.

use std::io;
use std::sync::Arc;

use mmo_net::{Listener, TransportError};
use tokio::sync::{mpsc, watch};

use crate::error::SyncError;
use crate::update_manager::UpdateManager;

/// Accepts session streams and hands each one to the [`UpdateManager`].
pub struct GameServer {
    manager: Arc<UpdateManager>,
    shutdown_tx: watch::Sender<bool>,
}

impl GameServer {
    pub fn new(manager: Arc<UpdateManager>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            manager,
            shutdown_tx,
        }
    }

    pub fn manager(&self) -> &Arc<UpdateManager> {
        &self.manager
    }

    /// A receiver that turns `true` when [`shutdown`](Self::shutdown) is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Signal the accept loop and tick loop to stop and close every session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send_replace(true);
        self.manager.close_all();
    }

    /// Spawns the tick loop. Non-fatal tick errors arrive on `errors`.
    pub fn spawn_tick_loop(
        &self,
        errors: mpsc::UnboundedSender<SyncError>,
    ) -> tokio::task::JoinHandle<Result<(), SyncError>> {
        let manager = Arc::clone(&self.manager);
        let shutdown = self.shutdown_signal();
        tokio::spawn(async move { manager.run(shutdown, errors).await })
    }

    /// Run the accept loop until shutdown. Every accepted stream is admitted
    /// and served on its own task.
    pub async fn run(&self, mut listener: Listener) -> Result<(), TransportError> {
        let mut shutdown_rx = self.shutdown_signal();
        tracing::info!("Accepting {:?} sessions on {}", listener.kind(), listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok(stream) => {
                        tracing::debug!("New session stream from {}", stream.peer);
                        let manager = Arc::clone(&self.manager);
                        tokio::spawn(async move {
                            let reason = manager.run_session(stream).await;
                            tracing::debug!("Session task ended: {reason}");
                        });
                    }
                    Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::NotConnected => {
                        return Err(TransportError::Io(e));
                    }
                    Err(e) => tracing::warn!("Accept failed: {e}"),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("Server shutting down");
                        break;
                    }
                }
            }
        }

        self.manager.close_all();
        if let Listener::Quic(quic) = &listener {
            quic.close();
        }
        Ok(())
    }
}
