//! Configuration module for stammer-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::ffi::OsString;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::{DEFAULT_BACKLOG, DEFAULT_BUFFER_CAPACITY, DEFAULT_STAMMER_DELAY};

/// Which program to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Echo every byte back to the client that sent it
    Echo,
    /// Relay each client to a fixed backend
    Proxy,
    /// Relay to a backend with fragmented, delayed sends
    Stammer,
    /// Generate load against a relay and check byte conservation
    Client,
}

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "stammer-relay")]
#[command(author = "stammer-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded TCP echo server, proxy and fault-injecting proxy", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Program to run
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Listen port or address (e.g., 50000 or 127.0.0.1:50000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Backend (proxy, stammer) or target (client) as host:port
    #[arg(short = 's', long)]
    pub server: Option<String>,

    /// Number of concurrent clients in client mode
    #[arg(short = 'n', long)]
    pub num_clients: Option<usize>,

    /// Log readiness sets and fragment sizes
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl CliArgs {
    /// Parse arguments. Only `--help` and `--version` exit from here; any
    /// other problem is a `ConfigError` and exits like one.
    pub fn try_from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match Self::try_parse_from(args) {
            Ok(cli) => Ok(cli),
            Err(e) if !e.use_stderr() => e.exit(),
            Err(e) => Err(ConfigError::Args(e)),
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub stammer: StammerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay-related configuration
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    pub mode: Option<Mode>,
    /// Listen port or address
    pub listen: Option<String>,
    /// Backend or load target address
    pub server: Option<String>,
    /// Bytes buffered per forwarder
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Upper bound on a single readiness wait
    #[serde(default = "default_poll_ceiling_ms")]
    pub poll_ceiling_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: None,
            listen: None,
            server: None,
            buffer_capacity: default_buffer_capacity(),
            listen_backlog: default_listen_backlog(),
            poll_ceiling_ms: default_poll_ceiling_ms(),
            max_connections: default_max_connections(),
        }
    }
}

/// Stammer-mode configuration
#[derive(Debug, Deserialize)]
pub struct StammerConfig {
    /// Delay before retrying a partially sent buffer
    #[serde(default = "default_stammer_delay_ms")]
    pub delay_ms: u64,
}

impl Default for StammerConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_stammer_delay_ms(),
        }
    }
}

/// Load generator configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_num_clients")]
    pub num_clients: usize,
    /// Sends are `1..max_chunk` bytes long
    #[serde(default = "default_max_chunk")]
    pub max_chunk: usize,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Each send half-closes with probability `1 / half_close_one_in`
    #[serde(default = "default_half_close_one_in")]
    pub half_close_one_in: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            num_clients: default_num_clients(),
            max_chunk: default_max_chunk(),
            read_chunk: default_read_chunk(),
            half_close_one_in: default_half_close_one_in(),
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

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

fn default_listen_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_poll_ceiling_ms() -> u64 {
    60_000
}

fn default_max_connections() -> usize {
    1024
}

fn default_stammer_delay_ms() -> u64 {
    DEFAULT_STAMMER_DELAY.as_millis() as u64
}

fn default_num_clients() -> usize {
    4
}

fn default_max_chunk() -> usize {
    2048
}

fn default_read_chunk() -> usize {
    1024
}

fn default_half_close_one_in() -> u32 {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen(mode: Mode) -> &'static str {
    match mode {
        Mode::Echo => "50001",
        _ => "50000",
    }
}

fn default_server(mode: Mode) -> &'static str {
    match mode {
        Mode::Client => "127.0.0.1:50000",
        _ => "127.0.0.1:50001",
    }
}

/// Load generator settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub num_clients: usize,
    pub max_chunk: usize,
    pub read_chunk: usize,
    pub half_close_one_in: u32,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: SocketAddr,
    pub server: SocketAddr,
    pub buffer_capacity: usize,
    pub listen_backlog: i32,
    pub poll_ceiling: Duration,
    pub max_connections: usize,
    pub stammer_delay: Duration,
    pub client: ClientSettings,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::try_from_args(std::env::args_os())?;

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            relay,
            stammer,
            client,
            logging,
        } = toml_config;

        let mode = cli.mode.or(relay.mode).unwrap_or(Mode::Proxy);

        let listen = cli
            .listen
            .or(relay.listen)
            .unwrap_or_else(|| default_listen(mode).to_string());
        let server = cli
            .server
            .or(relay.server)
            .unwrap_or_else(|| default_server(mode).to_string());

        let config = Config {
            mode,
            listen: parse_listen(&listen)?,
            server: resolve_host_port("server", &server)?,
            buffer_capacity: relay.buffer_capacity,
            listen_backlog: relay.listen_backlog,
            poll_ceiling: Duration::from_millis(relay.poll_ceiling_ms),
            max_connections: relay.max_connections,
            stammer_delay: Duration::from_millis(stammer.delay_ms),
            client: ClientSettings {
                num_clients: cli.num_clients.unwrap_or(client.num_clients),
                max_chunk: client.max_chunk,
                read_chunk: client.read_chunk,
                half_close_one_in: client.half_close_one_in,
            },
            log_level: if cli.debug {
                "debug".to_string()
            } else if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Backend address for relay modes that pair clients with a server.
    pub fn backend(&self) -> Option<SocketAddr> {
        match self.mode {
            Mode::Proxy | Mode::Stammer => Some(self.server),
            Mode::Echo | Mode::Client => None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer_capacity must be at least 1".into()));
        }
        if self.listen_backlog < 1 {
            return Err(ConfigError::Invalid("listen_backlog must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.poll_ceiling.is_zero() {
            return Err(ConfigError::Invalid("poll_ceiling_ms must be at least 1".into()));
        }
        if self.client.max_chunk < 2 {
            return Err(ConfigError::Invalid("client.max_chunk must be at least 2".into()));
        }
        if self.client.read_chunk == 0 {
            return Err(ConfigError::Invalid("client.read_chunk must be at least 1".into()));
        }
        if self.client.half_close_one_in == 0 {
            return Err(ConfigError::Invalid(
                "client.half_close_one_in must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A bare port binds all IPv4 interfaces.
fn parse_listen(value: &str) -> Result<SocketAddr, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) => Ok(SocketAddr::from(([0, 0, 0, 0], port))),
        Err(_) => resolve_host_port("listen", value),
    }
}

/// Resolve `host:port`, preferring an IPv4 address.
fn resolve_host_port(what: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    let bad = |reason: String| ConfigError::BadAddress {
        what,
        value: value.to_string(),
        reason,
    };
    let addrs: Vec<SocketAddr> = value
        .trim()
        .to_socket_addrs()
        .map_err(|e| bad(e.to_string()))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| bad("no addresses found".to_string()))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Args(clap::Error),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    BadAddress {
        what: &'static str,
        value: String,
        reason: String,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Args(e) => write!(f, "{e}"),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::BadAddress {
                what,
                value,
                reason,
            } => {
                write!(f, "Can't parse {what} address from {value:?}: {reason}")
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args<'a>(args: &'a [&'a str]) -> impl Iterator<Item = &'a str> {
        std::iter::once("stammer-relay").chain(args.iter().copied())
    }

    fn cli(list: &[&str]) -> CliArgs {
        CliArgs::try_from_args(args(list)).unwrap()
    }

    #[test]
    fn test_malformed_arguments_exit_like_config_errors() {
        let cases: [&[&str]; 3] = [&["-n", "abc"], &["-m", "bogus"], &["--no-such-flag"]];
        for case in cases {
            let err = CliArgs::try_from_args(args(case)).unwrap_err();
            assert!(matches!(err, ConfigError::Args(_)), "{case:?}");
            assert_eq!(crate::error::RelayError::from(err).exit_code(), 1);
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.relay.buffer_capacity, 1000);
        assert_eq!(config.relay.listen_backlog, 2);
        assert_eq!(config.relay.poll_ceiling_ms, 60_000);
        assert_eq!(config.stammer.delay_ms, 100);
        assert_eq!(config.client.num_clients, 4);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [relay]
            mode = "stammer"
            listen = "127.0.0.1:6000"
            server = "127.0.0.1:6001"
            buffer_capacity = 4096

            [stammer]
            delay_ms = 250

            [client]
            num_clients = 16

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.relay.mode, Some(Mode::Stammer));
        assert_eq!(config.relay.listen.as_deref(), Some("127.0.0.1:6000"));
        assert_eq!(config.relay.buffer_capacity, 4096);
        assert_eq!(config.relay.listen_backlog, 2);
        assert_eq!(config.stammer.delay_ms, 250);
        assert_eq!(config.client.num_clients, 16);
        assert_eq!(config.client.max_chunk, 2048);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_mode_defaults() {
        let echo = Config::resolve(cli(&["-m", "echo"]), TomlConfig::default()).unwrap();
        assert_eq!(echo.listen, "0.0.0.0:50001".parse().unwrap());
        assert_eq!(echo.backend(), None);

        let proxy = Config::resolve(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(proxy.mode, Mode::Proxy);
        assert_eq!(proxy.listen, "0.0.0.0:50000".parse().unwrap());
        assert_eq!(proxy.backend(), Some("127.0.0.1:50001".parse().unwrap()));
        assert_eq!(proxy.stammer_delay, Duration::from_millis(100));

        let client = Config::resolve(cli(&["--mode", "client", "-n", "9"]), TomlConfig::default())
            .unwrap();
        assert_eq!(client.server, "127.0.0.1:50000".parse().unwrap());
        assert_eq!(client.client.num_clients, 9);
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [relay]
            mode = "echo"
            listen = "7000"
            "#,
        )
        .unwrap();
        let config =
            Config::resolve(cli(&["-m", "stammer", "-l", "7100", "-d"]), toml_config).unwrap();
        assert_eq!(config.mode, Mode::Stammer);
        assert_eq!(config.listen.port(), 7100);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_malformed_addresses_are_rejected() {
        let err = Config::resolve(cli(&["-s", "no-port-here"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::BadAddress { what: "server", .. }));

        let err = Config::resolve(cli(&["-l", "99999"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::BadAddress { what: "listen", .. }));
    }

    #[test]
    fn test_zero_buffer_capacity_is_invalid() {
        let toml_config: TomlConfig = toml::from_str("[relay]\nbuffer_capacity = 0\n").unwrap();
        let err = Config::resolve(cli(&[]), toml_config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
