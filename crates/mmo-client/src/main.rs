//! Console participant: joins the shared world, predicts its own moves and
//! prints what it sees.
//!
//! Run with: `cargo run -p mmo-client -- --id alice`
//!
//! Commands on stdin: `w`/`a`/`s`/`d` move, `look` lists players,
//! `quit` leaves, anything else is said aloud.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use glam::DVec2;
use mmo_config::{CliArgs, Config, TransportKind, default_config_dir};
use mmo_multiplayer::{GameWorld, LocalIntent};
use mmo_net::{ClientNetConfig, GameClient, dial};
use mmo_world::Timestamp;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Matches the file the server writes next to its own config.
const GENERATED_CERT_FILE: &str = "server-cert.der";
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, PartialEq)]
enum Command {
    Act(LocalIntent),
    Look,
    Quit,
    Nothing,
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let direction = match line {
        "" => return Command::Nothing,
        "look" => return Command::Look,
        "quit" => return Command::Quit,
        "w" => DVec2::new(0.0, -1.0),
        "s" => DVec2::new(0.0, 1.0),
        "a" => DVec2::new(-1.0, 0.0),
        "d" => DVec2::new(1.0, 0.0),
        text => return Command::Act(LocalIntent::Speak(text.to_string())),
    };
    Command::Act(LocalIntent::Move(direction))
}

fn describe(game: &GameWorld) {
    let now = Timestamp::now();
    for (id, player) in game.current_world_view().players {
        let marker = if id == game.local_id() { "*" } else { " " };
        let speech = game.visible_speech(&id, now);
        println!(
            "{marker} {id:<16} ({:>7.1}, {:>7.1}) {}",
            player.position.x,
            player.position.y,
            speech.join(" / ")
        );
    }
}

/// Certificates the QUIC client accepts: the configured one, or the one a
/// local server generated in the same config directory.
fn trusted_certificates(config: &Config, config_dir: &Path) -> Vec<Vec<u8>> {
    let path: PathBuf = config
        .client
        .trusted_cert_path
        .clone()
        .unwrap_or_else(|| config_dir.join(GENERATED_CERT_FILE));
    match std::fs::read(&path) {
        Ok(der) => vec![der],
        Err(e) => {
            warn!("No trusted certificate at {}: {e}", path.display());
            Vec::new()
        }
    }
}

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
    mmo_log::init_logging(None, false, Some(&config));

    if config.client.player_id.trim().is_empty() {
        error!("No player ID; pass --id or set client.player_id");
        return ExitCode::FAILURE;
    }

    let trusted = match config.network.transport {
        TransportKind::Tcp => Vec::new(),
        TransportKind::Quic => trusted_certificates(&config, &config_dir),
    };
    let stream = match dial(&config.network, &trusted).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Cannot reach {}: {e}", config.network.endpoint());
            return ExitCode::FAILURE;
        }
    };

    let player_id = config.client.player_id.clone();
    let (client, mut events) =
        match GameClient::connect(stream, &player_id, ClientNetConfig::from_config(&config)).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Cannot log in as {player_id:?}: {e}");
                return ExitCode::FAILURE;
            }
        };
    let mut game = GameWorld::from_config(&config);
    info!("Joined as {player_id:?}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut frames = tokio::time::interval(FRAME_INTERVAL);

    let code = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break ExitCode::FAILURE;
                };
                if let Err(e) = game.handle_event(event) {
                    error!("{e}");
                    break ExitCode::FAILURE;
                }
            }
            line = lines.next_line() => {
                let command = match line {
                    Ok(Some(line)) => parse_command(&line),
                    Ok(None) => Command::Quit,
                    Err(e) => {
                        warn!("Cannot read stdin: {e}");
                        Command::Quit
                    }
                };
                match command {
                    Command::Act(intent) => {
                        if let Some(request) = game.local_intent(intent)
                            && let Err(e) = client.send(request).await
                        {
                            error!("Send failed: {e}");
                            break ExitCode::FAILURE;
                        }
                    }
                    Command::Look => describe(&game),
                    Command::Quit => break ExitCode::SUCCESS,
                    Command::Nothing => {}
                }
            }
            _ = frames.tick() => {
                game.frame();
            }
        }
    };

    client.disconnect().await;
    info!("Left the world");
    code
}
