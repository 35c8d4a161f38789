//! Configuration for the chat server
//!
//! Values come from command-line arguments, an optional TOML file and
//! built-in defaults, in that order of precedence.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug, Default)]
#[command(name = "line_chat")]
#[command(version)]
#[command(about = "A line-based multi-user TCP chat server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address to bind to
    #[arg(long)]
    pub ip: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Seconds without an inbound line before a user is kicked
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Longest accepted inbound line, in bytes
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Outbound messages buffered per user
    #[arg(long)]
    pub mailbox_capacity: Option<usize>,

    /// Milliseconds the pump waits on a full mailbox before dropping
    #[arg(long)]
    pub delivery_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub server: ServerSection,
    pub session: SessionSection,
    pub delivery: DeliverySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerSection {
    pub ip: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SessionSection {
    /// Seconds
    pub idle_timeout: Option<u64>,
    pub max_line_length: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DeliverySection {
    pub mailbox_capacity: Option<usize>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
}

const DEFAULT_IP: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8888;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_LINE_LENGTH: usize = 4096;
const DEFAULT_MAILBOX_CAPACITY: usize = 16;
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 1000;
const DEFAULT_LOG_LEVEL: &str = "info";

// Upper bounds keep deadline arithmetic and channel allocation in range
const MAX_IDLE_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const MAX_DELIVERY_TIMEOUT_MS: u64 = 10 * 60 * 1000;
const MAX_MAILBOX_CAPACITY: usize = 1 << 16;

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub ip: String,
    pub port: u16,
    pub idle_timeout: Duration,
    pub max_line_length: usize,
    pub mailbox_capacity: usize,
    pub delivery_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip: DEFAULT_IP.to_string(),
            port: DEFAULT_PORT,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed arguments over the TOML file (if any) over defaults.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => {
                let path_str = path.display().to_string();
                let contents = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::FileRead {
                        path: path_str.clone(),
                        source,
                    }
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path_str,
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        Self::merge(cli, file)
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let idle_secs = cli
            .idle_timeout
            .or(file.session.idle_timeout)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        let delivery_ms = cli
            .delivery_timeout_ms
            .or(file.delivery.timeout_ms)
            .unwrap_or(DEFAULT_DELIVERY_TIMEOUT_MS);

        let config = Config {
            ip: cli.ip.or(file.server.ip).unwrap_or(defaults.ip),
            port: cli.port.or(file.server.port).unwrap_or(defaults.port),
            idle_timeout: Duration::from_secs(idle_secs),
            max_line_length: cli
                .max_line_length
                .or(file.session.max_line_length)
                .unwrap_or(defaults.max_line_length),
            mailbox_capacity: cli
                .mailbox_capacity
                .or(file.delivery.mailbox_capacity)
                .unwrap_or(defaults.mailbox_capacity),
            delivery_timeout: Duration::from_millis(delivery_ms),
            log_level: cli
                .log_level
                .or(file.logging.level)
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("idle timeout must be positive"));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid("max line length must be positive"));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid("mailbox capacity must be positive"));
        }
        if self.delivery_timeout.is_zero() {
            return Err(ConfigError::Invalid("delivery timeout must be positive"));
        }
        if self.idle_timeout > Duration::from_secs(MAX_IDLE_TIMEOUT_SECS) {
            return Err(ConfigError::Invalid("idle timeout must be at most one day"));
        }
        if self.delivery_timeout > Duration::from_millis(MAX_DELIVERY_TIMEOUT_MS) {
            return Err(ConfigError::Invalid(
                "delivery timeout must be at most ten minutes",
            ));
        }
        if self.mailbox_capacity > MAX_MAILBOX_CAPACITY {
            return Err(ConfigError::Invalid("mailbox capacity must be at most 65536"));
        }
        Ok(())
    }

    /// `ip:port` string for `TcpListener::bind`
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// How long a closing session waits for its delivery task
    pub fn drain_timeout(&self) -> Duration {
        self.delivery_timeout.saturating_mul(2)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    TomlParse {
        path: String,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
