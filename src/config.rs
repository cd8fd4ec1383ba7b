//! Configuration for the echo server and client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The bind port is
//! validated before any socket is opened.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Which side of the exchange this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Accept connections and echo each inbound chunk back.
    Server,
    /// Connect, send one payload, and log what comes back.
    Client,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "rebound")]
#[command(version = "0.1.0")]
#[command(about = "A minimal TCP echo server and client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as server (default) or client
    #[arg(short, long, value_enum)]
    pub role: Option<Role>,

    /// Host to bind (server) or connect to (client)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// TCP port, 1-65535
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of reactor threads (0 = one per CPU core)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Payload the client sends on connect
    #[arg(long)]
    pub payload: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of reactor threads (0 = one per CPU core)
    #[serde(default)]
    pub workers: usize,
    /// Inbound read window per connection, in bytes
    #[serde(default = "default_read_window")]
    pub read_window: usize,
    /// Grace period for flushing connections on shutdown, in milliseconds
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: 0,
            read_window: default_read_window(),
            grace_ms: default_grace_ms(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Payload sent on connect
    #[serde(default = "default_payload")]
    pub payload: String,
    /// Deadline for the whole exchange, in milliseconds
    #[serde(default = "default_client_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            payload: default_payload(),
            timeout_ms: default_client_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_read_window() -> usize {
    64 * 1024 // 64 KiB
}

fn default_grace_ms() -> u64 {
    1_000
}

fn default_payload() -> String {
    "Netty rocks!".to_string()
}

fn default_client_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub read_window: usize,
    pub grace_ms: u64,
    pub payload: String,
    pub client_timeout_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let port = cli.port.unwrap_or(toml_config.server.port);
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }

        Ok(Config {
            role: cli.role.unwrap_or(Role::Server),
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            read_window: toml_config.server.read_window,
            grace_ms: toml_config.server.grace_ms,
            payload: cli.payload.unwrap_or(toml_config.client.payload),
            client_timeout_ms: toml_config.client.timeout_ms,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidPort(u16),
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
            ConfigError::InvalidPort(port) => {
                write!(f, "Invalid port {port}: must be in range 1-65535")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
