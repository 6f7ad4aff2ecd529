//! Configuration for the shared-world server and its clients.
//!
//! Settings persist to disk as `config.ron`. Every section is
//! `#[serde(default)]` so older files keep loading as fields are added, and
//! command-line flags parsed with clap override whatever the file says.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    ClientConfig, Config, DebugConfig, NetworkConfig, ServerConfig, TransportKind, WorldConfig,
    default_config_dir,
};
pub use error::ConfigError;
