//! Authoritative shared-world server.
//!
//! Run with: `cargo run -p mmo-server -- --protocol quic --port 7777`

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mmo_config::{CliArgs, Config, ServerConfig, TransportKind, default_config_dir};
use mmo_multiplayer::{GameServer, ServerSettings, UpdateManager};
use mmo_net::{Listener, QuicError, QuicIdentity};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Where a generated self-signed certificate is written for clients to trust.
const GENERATED_CERT_FILE: &str = "server-cert.der";

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone().map_or_else(default_config_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Cannot resolve config directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Cannot load config from {}: {e}", config_dir.display());
            return ExitCode::FAILURE;
        }
    };
    config.apply_cli_overrides(&args);
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    mmo_log::init_logging(
        Some(&config_dir.join("logs")),
        cfg!(debug_assertions),
        Some(&config),
    );
    info!("Config directory: {}", config_dir.display());

    let identity = match config.network.transport {
        TransportKind::Tcp => None,
        TransportKind::Quic => match quic_identity(&config, &config_dir) {
            Ok(identity) => Some(identity),
            Err(e) => {
                error!("Cannot set up QUIC identity: {e}");
                return ExitCode::FAILURE;
            }
        },
    };

    let listener = match Listener::bind(&config.network, identity.as_ref()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot bind {}: {e}", config.network.endpoint());
            return ExitCode::FAILURE;
        }
    };

    let manager = Arc::new(UpdateManager::new(ServerSettings::from_config(&config)));
    let server = Arc::new(GameServer::new(manager));
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let mut tick_loop = server.spawn_tick_loop(errors_tx);

    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(listener).await })
    };

    let code = loop {
        tokio::select! {
            Some(e) = errors_rx.recv() => warn!("Tick error: {e}"),
            ticked = &mut tick_loop => {
                match ticked {
                    Ok(Ok(())) => break ExitCode::SUCCESS,
                    Ok(Err(e)) => error!("Tick loop stopped: {e}"),
                    Err(e) => error!("Tick loop panicked: {e}"),
                }
                break ExitCode::FAILURE;
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Cannot listen for Ctrl-C: {e}");
                }
                info!("Interrupted");
                break ExitCode::SUCCESS;
            }
        }
    };

    server.shutdown();
    match accept.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Accept loop failed: {e}"),
        Err(e) => error!("Accept loop panicked: {e}"),
    }
    info!("Server stopped");
    code
}

/// Loads the configured certificate and key, or generates a self-signed
/// certificate for `network.quic_server_name` and stores it in `config_dir`.
fn quic_identity(config: &Config, config_dir: &Path) -> Result<QuicIdentity, QuicError> {
    if let ServerConfig {
        quic_cert_path: Some(cert),
        quic_key_path: Some(key),
        ..
    } = &config.server
    {
        info!("Loading QUIC certificate from {}", cert.display());
        return QuicIdentity::from_der_files(cert, key);
    }

    let identity = QuicIdentity::self_signed(&[config.network.quic_server_name.clone()])?;
    let cert_path: PathBuf = config_dir.join(GENERATED_CERT_FILE);
    std::fs::write(&cert_path, identity.certificate_der())?;
    info!(
        "Generated self-signed certificate for {:?} at {}",
        config.network.quic_server_name,
        cert_path.display()
    );
    Ok(identity)
}
