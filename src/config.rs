//! Configuration module for the static-mux server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// I/O engine used to drive connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Readiness-based, edge-triggered (epoll on Linux, kqueue on macOS).
    Mio,
    /// Completion-based io_uring (Linux only).
    #[value(name = "uring")]
    #[serde(rename = "uring")]
    IoUring,
    /// One connection at a time with blocking sockets.
    Blocking,
}

/// Scheduling policy for the io_uring engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UringMode {
    /// Exactly one operation in flight; clients are served strictly in turn.
    Serial,
    /// Many operations in flight, correlated by token.
    Pipelined,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "static-mux")]
#[command(author = "static-mux authors")]
#[command(version = "0.1.0")]
#[command(about = "Serves a single static file to every TCP client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// File served to every client
    #[arg(short = 'r', long)]
    pub resource: Option<PathBuf>,

    /// I/O engine
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// io_uring scheduling policy
    #[arg(long, value_enum)]
    pub uring_mode: Option<UringMode>,

    /// Close connections idle for this many milliseconds (0 = never)
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

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
    pub resource: ResourceConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// I/O engine
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            runtime: default_runtime(),
        }
    }
}

/// Static resource configuration
#[derive(Debug, Deserialize)]
pub struct ResourceConfig {
    /// Path of the file served to every client
    #[serde(default = "default_resource")]
    pub path: PathBuf,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            path: default_resource(),
        }
    }
}

/// Event loop tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Scratch buffer used to drain request bytes
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Maximum readiness events returned by one poll
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// io_uring submission queue entries
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    /// io_uring scheduling policy
    #[serde(default = "default_uring_mode")]
    pub uring_mode: UringMode,
    /// Idle timeout in milliseconds (0 = disabled)
    #[serde(default)]
    pub idle_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            max_events: default_max_events(),
            ring_size: default_ring_size(),
            uring_mode: default_uring_mode(),
            idle_timeout_ms: 0,
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

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Mio
}

fn default_resource() -> PathBuf {
    PathBuf::from("index.html")
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_max_events() -> usize {
    64
}

fn default_ring_size() -> u32 {
    256
}

fn default_uring_mode() -> UringMode {
    UringMode::Serial
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub resource: PathBuf,
    pub runtime: RuntimeType,
    pub uring_mode: UringMode,
    pub read_buffer_size: usize,
    pub max_events: usize,
    pub ring_size: u32,
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
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

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;

        let idle_timeout_ms = cli
            .idle_timeout_ms
            .unwrap_or(toml_config.runtime.idle_timeout_ms);

        let tuning = &toml_config.runtime;
        if tuning.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be non-zero"));
        }
        if tuning.max_events == 0 {
            return Err(ConfigError::Invalid("max_events must be non-zero"));
        }
        if tuning.ring_size == 0 {
            return Err(ConfigError::Invalid("ring_size must be non-zero"));
        }

        Ok(Config {
            listen,
            backlog: toml_config.server.backlog,
            resource: cli.resource.unwrap_or(toml_config.resource.path),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            uring_mode: cli.uring_mode.unwrap_or(toml_config.runtime.uring_mode),
            read_buffer_size: toml_config.runtime.read_buffer_size,
            max_events: toml_config.runtime.max_events,
            ring_size: toml_config.runtime.ring_size,
            idle_timeout: (idle_timeout_ms > 0).then(|| Duration::from_millis(idle_timeout_ms)),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        let toml_config = TomlConfig::default();
        Config {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backlog: toml_config.server.backlog,
            resource: toml_config.resource.path,
            runtime: toml_config.server.runtime,
            uring_mode: toml_config.runtime.uring_mode,
            read_buffer_size: toml_config.runtime.read_buffer_size,
            max_events: toml_config.runtime.max_events,
            ring_size: toml_config.runtime.ring_size,
            idle_timeout: None,
            log_level: toml_config.logging.level,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, std::net::AddrParseError),
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
            ConfigError::InvalidListen(addr, e) => {
                write!(f, "Invalid listen address '{}': {}", addr, e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("static-mux").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert!(config.server.backlog >= 128);
        assert_eq!(config.server.runtime, RuntimeType::Mio);
        assert_eq!(config.resource.path, PathBuf::from("index.html"));
        assert_eq!(config.runtime.uring_mode, UringMode::Serial);
        assert_eq!(config.runtime.idle_timeout_ms, 0);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9090"
            backlog = 256
            runtime = "uring"

            [resource]
            path = "/srv/www/index.html"

            [runtime]
            read_buffer_size = 1024
            uring_mode = "pipelined"
            idle_timeout_ms = 5000

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9090");
        assert_eq!(config.server.backlog, 256);
        assert_eq!(config.server.runtime, RuntimeType::IoUring);
        assert_eq!(config.resource.path, PathBuf::from("/srv/www/index.html"));
        assert_eq!(config.runtime.read_buffer_size, 1024);
        assert_eq!(config.runtime.max_events, 64);
        assert_eq!(config.runtime.uring_mode, UringMode::Pipelined);
        assert_eq!(config.runtime.idle_timeout_ms, 5000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9090"
            runtime = "blocking"

            [runtime]
            idle_timeout_ms = 5000
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["-l", "127.0.0.1:7070", "--runtime", "mio", "--idle-timeout-ms", "0"]),
            file,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:7070".parse::<SocketAddr>().unwrap());
        assert_eq!(config.runtime, RuntimeType::Mio);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.resource, PathBuf::from("index.html"));
    }

    #[test]
    fn test_idle_timeout_from_file() {
        let file: TomlConfig = toml::from_str("[runtime]\nidle_timeout_ms = 250\n").unwrap();
        let config = Config::merge(cli(&[]), file).unwrap();
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_invalid_listen_address() {
        let err = Config::merge(cli(&["-l", "not-an-address"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListen(..)));
        assert!(err.to_string().contains("not-an-address"));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        for (section, field) in [
            ("[runtime]\nread_buffer_size = 0\n", "read_buffer_size"),
            ("[runtime]\nmax_events = 0\n", "max_events"),
            ("[runtime]\nring_size = 0\n", "ring_size"),
        ] {
            let file: TomlConfig = toml::from_str(section).unwrap();
            let err = Config::merge(cli(&[]), file).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)));
            assert!(err.to_string().contains(field));
        }

        let file: TomlConfig = toml::from_str("[runtime]\nread_buffer_size = 1\n").unwrap();
        assert_eq!(Config::merge(cli(&[]), file).unwrap().read_buffer_size, 1);
    }
}
