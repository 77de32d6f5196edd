//! Configuration module for phantom.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::packet;
use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// How long a client waits for its echo before counting a drop
pub const DEFAULT_RECEIVE_DEADLINE_MS: u64 = 1000;

/// Aggregator sampling period
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 1000;

/// Pause between worker spawns in fixed mode
pub const DEFAULT_SPAWN_PAUSE_MS: u64 = 10;

/// Pause before retrying a failed send
pub const DEFAULT_SEND_BACKOFF_MS: u64 = 10;

/// How often ramp mode checks the drop counter
pub const DEFAULT_LOSS_POLL_MS: u64 = 1000;

/// Worker cap used in ramp mode, where the loss point ends the run
pub const RAMP_MAX_CLIENTS: usize = 10_000;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "phantom")]
#[command(author = "phantom authors")]
#[command(version = "0.1.0")]
#[command(about = "UDP load generator with a key-validating echo bouncer", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run as the echo bouncer
    #[arg(short = 's', long)]
    pub server: bool,

    /// Server key (random for the server when unset, required for clients)
    #[arg(short = 'k', long, allow_hyphen_values = true)]
    pub key: Option<i64>,

    /// Number of clients to run
    #[arg(short = 'n', long)]
    pub clients: Option<usize>,

    /// Packets to send per client (0 or less = until stopped)
    #[arg(short = 'c', long, allow_hyphen_values = true)]
    pub packets: Option<i64>,

    /// Packet size in bytes, including IP and UDP headers
    #[arg(short = 'b', long)]
    pub size: Option<usize>,

    /// Seconds between client spawns in ramp-up mode (0 = fixed mode)
    #[arg(short = 'r', long)]
    pub ramp: Option<u64>,

    /// Drops needed to end a ramp
    #[arg(long)]
    pub loss_threshold: Option<u64>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// host:port of the bouncer (client) or port to listen on (server)
    pub target: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bouncer configuration
#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    /// Port to listen on (0 = ephemeral)
    #[serde(default)]
    pub port: u16,
    /// Server key
    pub key: Option<i64>,
    /// SO_RCVBUF size in bytes
    pub recv_buffer: Option<usize>,
}

/// Load generator configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Bouncer address
    pub target: Option<String>,
    /// Key to embed in every datagram
    pub key: Option<i64>,
    #[serde(default = "default_clients")]
    pub clients: usize,
    #[serde(default = "default_packets")]
    pub packets: i64,
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    /// Ramp interval in seconds
    #[serde(default)]
    pub ramp_interval: u64,
    #[serde(default = "default_loss_threshold")]
    pub loss_threshold: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: None,
            key: None,
            clients: default_clients(),
            packets: default_packets(),
            packet_size: default_packet_size(),
            ramp_interval: 0,
            loss_threshold: default_loss_threshold(),
        }
    }
}

/// Timers, all in milliseconds
#[derive(Debug, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_receive_deadline_ms")]
    pub receive_deadline_ms: u64,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    #[serde(default = "default_spawn_pause_ms")]
    pub spawn_pause_ms: u64,
    #[serde(default = "default_send_backoff_ms")]
    pub send_backoff_ms: u64,
    #[serde(default = "default_loss_poll_ms")]
    pub loss_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            receive_deadline_ms: default_receive_deadline_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            spawn_pause_ms: default_spawn_pause_ms(),
            send_backoff_ms: default_send_backoff_ms(),
            loss_poll_ms: default_loss_poll_ms(),
        }
    }
}

/// Async runtime configuration
#[derive(Debug, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads
    pub workers: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_clients() -> usize {
    1
}

fn default_packets() -> i64 {
    1000
}

fn default_packet_size() -> usize {
    512
}

fn default_loss_threshold() -> u64 {
    1
}

fn default_receive_deadline_ms() -> u64 {
    DEFAULT_RECEIVE_DEADLINE_MS
}

fn default_stats_interval_ms() -> u64 {
    DEFAULT_STATS_INTERVAL_MS
}

fn default_spawn_pause_ms() -> u64 {
    DEFAULT_SPAWN_PAUSE_MS
}

fn default_send_backoff_ms() -> u64 {
    DEFAULT_SEND_BACKOFF_MS
}

fn default_loss_poll_ms() -> u64 {
    DEFAULT_LOSS_POLL_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub timing: Timing,
    pub workers: Option<usize>,
    pub log_level: String,
}

/// What this process runs as
#[derive(Debug, Clone)]
pub enum Mode {
    Server(ServerSettings),
    Client(LoadSettings),
}

/// Resolved bouncer settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: SocketAddr,
    pub key: i64,
    pub recv_buffer: Option<usize>,
}

/// Resolved load generator settings
#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub target: SocketAddr,
    pub key: i64,
    pub clients: usize,
    /// `None` runs each client until the run is stopped
    pub packets: Option<u64>,
    /// Clamped IP packet size
    pub packet_size: usize,
    /// `Some` selects ramp-up mode
    pub ramp_interval: Option<Duration>,
    pub loss_threshold: u64,
}

/// Resolved timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub receive_deadline: Duration,
    pub stats_interval: Duration,
    pub spawn_pause: Duration,
    pub send_backoff: Duration,
    pub loss_poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for Timing {
    fn from(t: &TimingConfig) -> Self {
        Timing {
            receive_deadline: Duration::from_millis(t.receive_deadline_ms.max(1)),
            stats_interval: Duration::from_millis(t.stats_interval_ms.max(1)),
            spawn_pause: Duration::from_millis(t.spawn_pause_ms),
            send_backoff: Duration::from_millis(t.send_backoff_ms),
            loss_poll: Duration::from_millis(t.loss_poll_ms.max(1)),
        }
    }
}

/// Map the packets flag onto a budget: anything below one is unbounded.
pub fn packet_budget(packets: i64) -> Option<u64> {
    u64::try_from(packets).ok().filter(|&n| n > 0)
}

/// Random positive 63-bit key
pub fn random_key() -> i64 {
    rand::thread_rng().gen_range(1..=i64::MAX)
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mode = if cli.server {
            let port = match cli.target {
                Some(ref port) => port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::BadPort(port.clone()))?,
                None => toml_config.server.port,
            };
            // A zero key is the "unset" value, as on the command line.
            let key = cli
                .key
                .or(toml_config.server.key)
                .filter(|&k| k != 0)
                .unwrap_or_else(random_key);

            Mode::Server(ServerSettings {
                listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                key,
                recv_buffer: toml_config.server.recv_buffer,
            })
        } else {
            let client = toml_config.client;
            let target = cli
                .target
                .or(client.target)
                .ok_or(ConfigError::MissingTarget)?;
            let key = cli
                .key
                .or(client.key)
                .filter(|&k| k != 0)
                .ok_or(ConfigError::MissingKey)?;

            Mode::Client(LoadSettings {
                target: resolve_target(&target)?,
                key,
                clients: cli.clients.unwrap_or(client.clients),
                packets: packet_budget(cli.packets.unwrap_or(client.packets)),
                packet_size: packet::clamp_packet_size(cli.size.unwrap_or(client.packet_size)),
                ramp_interval: Some(cli.ramp.unwrap_or(client.ramp_interval))
                    .filter(|&secs| secs > 0)
                    .map(Duration::from_secs),
                loss_threshold: cli
                    .loss_threshold
                    .unwrap_or(client.loss_threshold)
                    .max(1),
            })
        };

        Ok(Config {
            mode,
            timing: Timing::from(&toml_config.timing),
            workers: cli.workers.or(toml_config.runtime.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

fn resolve_target(target: &str) -> Result<SocketAddr, ConfigError> {
    target
        .to_socket_addrs()
        .map_err(|e| ConfigError::BadTarget(target.to_string(), e.to_string()))?
        .next()
        .ok_or_else(|| ConfigError::BadTarget(target.to_string(), "no addresses".to_string()))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingTarget,
    MissingKey,
    BadTarget(String, String),
    BadPort(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingTarget => write!(f, "Specify server:port"),
            ConfigError::MissingKey => write!(f, "Specify server key"),
            ConfigError::BadTarget(target, e) => {
                write!(f, "Cannot resolve server address '{target}': {e}")
            }
            ConfigError::BadPort(port) => write!(f, "Invalid listen port '{port}'"),
        }
    }
}

impl std::error::Error for ConfigError {}
