//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, TransportKind};

/// Command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(about = "Shared-world server and console client")]
pub struct CliArgs {
    /// Address to bind (server) or dial (client).
    #[arg(long)]
    pub addr: Option<String>,

    /// Port to bind or dial.
    #[arg(long)]
    pub port: Option<u16>,

    /// Transport protocol.
    #[arg(long, value_enum)]
    pub protocol: Option<TransportKind>,

    /// Player ID to log in with (clients only).
    #[arg(long)]
    pub id: Option<String>,

    /// Server tick rate in Hz.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.addr {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(protocol) = args.protocol {
            self.network.transport = protocol;
        }
        if let Some(ref id) = args.id {
            self.client.player_id = id.clone();
        }
        if let Some(rate) = args.tick_rate {
            self.server.tick_rate_hz = rate;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
