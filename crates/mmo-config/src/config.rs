//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the config file inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration shared by the server binary and clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport and wire settings used by both sides.
    pub network: NetworkConfig,
    /// Authoritative server settings.
    pub server: ServerConfig,
    /// Client-side settings.
    pub client: ClientConfig,
    /// Simulation rules that client and server must agree on.
    pub world: WorldConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Underlying transport protocol for session streams.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportKind {
    /// Plain TCP, one session per connection.
    #[default]
    Tcp,
    /// QUIC over UDP, one session per bidirectional stream.
    Quic,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Transport protocol.
    pub transport: TransportKind,
    /// Server address (bind address on the server, dial address on clients).
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Largest accepted frame payload in bytes.
    pub max_frame_size: u32,
    /// Interval between client heartbeat frames, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long a new connection may take to send its connect request, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// TLS server name presented by QUIC clients.
    pub quic_server_name: String,
}

/// Authoritative server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Tick rate of the update loop (Hz).
    pub tick_rate_hz: u32,
    /// Pending requests a session may buffer before its reader stalls.
    pub request_queue_capacity: usize,
    /// Deadline for writing one broadcast frame to one session, in milliseconds.
    pub broadcast_timeout_ms: u64,
    /// Position new and returning players are placed at.
    pub spawn_position: (f64, f64),
    /// Longest accepted speech text, in characters.
    pub max_speech_length: usize,
    /// DER certificate for QUIC. A self-signed one is generated when unset.
    pub quic_cert_path: Option<PathBuf>,
    /// DER (PKCS#8) private key matching `quic_cert_path`.
    pub quic_key_path: Option<PathBuf>,
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Player ID to log in with.
    pub player_id: String,
    /// DER certificate the client trusts for QUIC connections.
    pub trusted_cert_path: Option<PathBuf>,
    /// Capacity of the buffer between the connection reader and the game loop.
    pub event_buffer: usize,
}

/// Simulation rules shared by client prediction and the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// Distance moved per unit of requested direction.
    pub move_step: f64,
    /// How long a speech line stays visible, in seconds.
    pub speech_ttl_secs: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            max_frame_size: 1_048_576,
            heartbeat_interval_ms: 2_000,
            handshake_timeout_ms: 10_000,
            quic_server_name: "localhost".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 20,
            request_queue_capacity: 100,
            broadcast_timeout_ms: 1_000,
            spawn_position: (0.0, 0.0),
            max_speech_length: 500,
            quic_cert_path: None,
            quic_key_path: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            player_id: String::new(),
            trusted_cert_path: None,
            event_buffer: 256,
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            move_step: 2.0,
            speech_ttl_secs: 5,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Derived durations ---

impl NetworkConfig {
    /// Heartbeat period as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Handshake deadline as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// `address:port` string for dialing or binding.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }
}

impl ServerConfig {
    /// Period of one tick. A zero tick rate is treated as 1 Hz.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }

    /// Broadcast write deadline as a [`Duration`].
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }
}

impl WorldConfig {
    /// Speech lifetime as a [`Duration`].
    pub fn speech_ttl(&self) -> Duration {
        Duration::from_secs(self.speech_ttl_secs)
    }
}

/// Platform config directory for this application (`<config>/mmo`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("mmo"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Rejects settings the server or a client cannot run with. Called on
    /// load; call it again after applying CLI overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });
        if self.server.tick_rate_hz == 0 {
            return invalid("server.tick_rate_hz", "must be at least 1");
        }
        if self.server.request_queue_capacity == 0 {
            return invalid("server.request_queue_capacity", "must be at least 1");
        }
        if self.network.max_frame_size == 0 {
            return invalid("network.max_frame_size", "must be at least 1");
        }
        if !self.world.move_step.is_finite() || self.world.move_step <= 0.0 {
            return invalid("world.move_step", "must be a positive number");
        }
        let (x, y) = self.server.spawn_position;
        if !x.is_finite() || !y.is_finite() {
            return invalid("server.spawn_position", "must be finite");
        }
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
