//! Configuration for the chunkd server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "chunkd")]
#[command(version = "0.1.0")]
#[command(about = "A chunk-framed request/response server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path of the listening socket (e.g. /tmp/chunk_example)
    #[arg(short = 's', long)]
    pub socket: Option<PathBuf>,

    /// Maximum acceptable request payload in bytes
    #[arg(short = 'm', long)]
    pub max_request_size: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds of inactivity before a connection is closed (0 disables)
    #[arg(short = 't', long)]
    pub idle_timeout: Option<u64>,

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
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Path of the listening socket
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Maximum acceptable request payload in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Seconds of inactivity before a connection is closed; 0 disables
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_size: default_max_request_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
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

fn default_socket() -> PathBuf {
    PathBuf::from("/tmp/chunk_example")
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_request_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub socket: PathBuf,
    pub max_request_size: usize,
    pub max_connections: usize,
    /// Zero disables the idle timeout.
    pub idle_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket: default_socket(),
            max_request_size: default_max_request_size(),
            max_connections: default_max_connections(),
            idle_timeout: Duration::from_secs(default_idle_timeout_secs()),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            socket: cli.socket.unwrap_or(toml_config.server.socket),
            max_request_size: cli
                .max_request_size
                .unwrap_or(toml_config.limits.max_request_size),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout
                    .unwrap_or(toml_config.limits.idle_timeout_secs),
            ),
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
        }
    }
}

impl std::error::Error for ConfigError {}
