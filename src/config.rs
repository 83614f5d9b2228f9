//! Configuration module for the relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the relay
#[derive(Parser, Debug, Default)]
#[command(name = "line-relay")]
#[command(author = "line-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-delimited TCP broadcast relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host name or address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (0 picks an ephemeral port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrently connected clients
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of messages the bus holds before producers block
    #[arg(long)]
    pub bus_capacity: Option<usize>,

    /// How long a reader may wait for bus space before its client is dropped
    #[arg(long)]
    pub publish_timeout_ms: Option<u64>,

    /// Deadline for a single write to a client
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Time allowed for readers and the broadcaster to drain on shutdown
    #[arg(long)]
    pub shutdown_grace_ms: Option<u64>,

    /// Longest accepted message, excluding the terminator
    #[arg(long)]
    pub max_frame_len: Option<usize>,

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
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Message distribution configuration
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    #[serde(default = "default_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Sent to every client when the relay stops
    #[serde(default = "default_shutdown_notice")]
    pub shutdown_notice: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bus_capacity: default_bus_capacity(),
            publish_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_frame_len: default_max_frame_len(),
            shutdown_notice: default_shutdown_notice(),
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

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    10_000
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_timeout_ms() -> u64 {
    2_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_max_frame_len() -> usize {
    64 * 1024 // 64 KB
}

fn default_shutdown_notice() -> String {
    "Server is terminating.".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub bus_capacity: usize,
    pub publish_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_frame_len: usize,
    pub shutdown_notice: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
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

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML values.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            relay,
            logging,
        } = toml_config;

        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            workers: cli.workers.or(server.workers),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            bus_capacity: cli.bus_capacity.unwrap_or(relay.bus_capacity),
            publish_timeout: Duration::from_millis(
                cli.publish_timeout_ms.unwrap_or(relay.publish_timeout_ms),
            ),
            write_timeout: Duration::from_millis(
                cli.write_timeout_ms.unwrap_or(relay.write_timeout_ms),
            ),
            shutdown_grace: Duration::from_millis(
                cli.shutdown_grace_ms.unwrap_or(relay.shutdown_grace_ms),
            ),
            max_frame_len: cli.max_frame_len.unwrap_or(relay.max_frame_len),
            shutdown_notice: relay.shutdown_notice,
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        }
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_capacity == 0 {
            return Err(ConfigError::Invalid("bus_capacity must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Invalid("max_frame_len must be at least 1"));
        }
        Ok(())
    }

    /// The `host:port` string handed to the listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.address(), "localhost:8080");
        assert_eq!(config.bus_capacity, 1024);
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert_eq!(config.shutdown_notice, "Server is terminating.");
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            workers = 4

            [relay]
            bus_capacity = 16
            write_timeout_ms = 250
            shutdown_notice = "bye"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.relay.bus_capacity, 16);
        assert_eq!(config.relay.write_timeout_ms, 250);
        assert_eq!(config.relay.publish_timeout_ms, 2_000);
        assert_eq!(config.relay.shutdown_notice, "bye");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [relay]
            bus_capacity = 16

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let cli = CliArgs {
            port: Some(7000),
            write_timeout_ms: Some(100),
            log_level: "info".to_string(),
            ..CliArgs::default()
        };

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 7000);
        assert_eq!(config.bus_capacity, 16);
        assert_eq!(config.write_timeout, Duration::from_millis(100));
        // "info" is the CLI default, so the file wins
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = Config {
            bus_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
