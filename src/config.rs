//! Configuration management for onion-control.
//!
//! This module provides configuration parsing from TOML files, command-line arguments,
//! and environment variables. Configuration is applied in order: defaults → config file →
//! command-line arguments, with later sources overriding earlier ones.
//!
//! # Configuration Flow
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── Start with sensible defaults
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌────────────────────┐
//!     │ Config file     │ ◄───│ onion-control.conf │  (TOML format)
//!     │ exists?         │     │ or --config        │
//!     └────────┬────────┘     └────────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Apply CLI args  │ ◄───│ --control       │
//!     │ and env vars    │     │ --listen-port   │
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Resolve target  │ ◄── "localhost:9051" becomes an IP address
//!     │ & validate      │
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Final Config    │
//!     └─────────────────┘
//! ```
//!
//! # Configuration Sources
//!
//! | Source | Priority | Description |
//! |--------|----------|-------------|
//! | Defaults | Lowest | Built-in defaults |
//! | Config File | Medium | TOML file (`--config` or `ONION_CONTROL_CONFIG`) |
//! | Environment | High | `ONION_CONTROL_TARGET`, `ONION_CONTROL_PASS`, `ONION_CONTROL_DATA_DIR` |
//! | CLI Arguments | Highest | Command-line flags override all |
//!
//! # Example Configuration File
//!
//! ```toml
//! # Control port
//! control_target = "127.0.0.1:9051"
//! # control_pass = "my_password"        # If using HASHEDPASSWORD auth
//!
//! # Onion service
//! listen_onion = true
//! listen_port = 31569
//! # onion_proxy = "127.0.0.1:9150"      # Leave proxy settings alone
//! data_dir = "."
//! key_type = "ED25519-V3"
//!
//! # Reconnect backoff
//! reconnect_initial_secs = 1.0
//! reconnect_growth = 1.5
//! reconnect_max_secs = 600.0
//! reconnect_jitter = 0.0
//! stop_timeout_secs = 1
//!
//! # Logging
//! loglevel = "notice"  # debug, info, notice, warn, error
//! # logfile = "/var/log/onion-control.log"
//! # logfile = ":syslog:"
//! ```
//!
//! # What This Module Does NOT Do
//!
//! - **Runtime reconfiguration**: Config is loaded once at startup
//! - **Encrypted config files**: Passwords are stored in plaintext

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Default control-port address.
pub const DEFAULT_CONTROL_TARGET: &str = "127.0.0.1:9051";

/// Default node listening port.
pub const DEFAULT_LISTEN_PORT: u16 = 31569;

/// Log level for onion-control output.
///
/// These levels control the verbosity of log output. From most to least verbose:
/// [`Debug`](LogLevel::Debug) > [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error)
///
/// # Example
///
/// ```rust
/// use onion_control::LogLevel;
///
/// let level = LogLevel::Notice;
/// assert!(level < LogLevel::Warn);
/// assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Main configuration.
///
/// # Fields
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `control_target` | `127.0.0.1:9051` | Control port `host:port` |
/// | `control_pass` | none | Password for HASHEDPASSWORD |
/// | `listen_onion` | true | Run the control worker at all |
/// | `listen_port` | 31569 | Virtual and target port of the onion service |
/// | `onion_proxy` | none | External onion proxy; disables proxy setup |
/// | `data_dir` | `.` | Directory holding `onion_private_key` |
/// | `key_type` | `ED25519-V3` | Key type for `NEW:<key_type>` |
/// | `reconnect_initial_secs` | 1.0 | First reconnect delay |
/// | `reconnect_growth` | 1.5 | Delay multiplier per disconnection |
/// | `reconnect_max_secs` | 600.0 | Delay cap |
/// | `reconnect_jitter` | 0.0 | Random spread of each delay (fraction) |
/// | `stop_timeout_secs` | 1 | How long `stop` waits for the worker |
///
/// # Validation
///
/// Call [`validate()`](Config::validate) to check configuration consistency:
///
/// - `control_target` must be a socket address
/// - Delays must be positive and finite, with the cap at least the initial delay
/// - Growth must be at least 1
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Control port address.
    #[serde(default = "default_control_target")]
    pub control_target: String,
    /// Password for control port authentication.
    #[serde(default)]
    pub control_pass: Option<String>,
    /// Provision an onion service at all.
    #[serde(default = "default_listen_onion")]
    pub listen_onion: bool,
    /// Node listening port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Externally configured onion proxy.
    #[serde(default)]
    pub onion_proxy: Option<String>,
    /// Directory for persistent files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Key type requested for a new service.
    #[serde(default = "default_key_type")]
    pub key_type: String,
    /// Initial reconnect delay in seconds.
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: f64,
    /// Reconnect delay growth factor.
    #[serde(default = "default_reconnect_growth")]
    pub reconnect_growth: f64,
    /// Reconnect delay cap in seconds.
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: f64,
    /// Reconnect delay jitter as a fraction of the delay.
    #[serde(default)]
    pub reconnect_jitter: f64,
    /// Seconds `stop` waits for the worker thread.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None for stdout, ":syslog:" for syslog.
    #[serde(default)]
    pub logfile: Option<String>,
}

fn default_control_target() -> String {
    DEFAULT_CONTROL_TARGET.to_string()
}
fn default_listen_onion() -> bool {
    true
}
fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_key_type() -> String {
    "ED25519-V3".to_string()
}
fn default_reconnect_initial_secs() -> f64 {
    1.0
}
fn default_reconnect_growth() -> f64 {
    1.5
}
fn default_reconnect_max_secs() -> f64 {
    600.0
}
fn default_stop_timeout_secs() -> u64 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_target: default_control_target(),
            control_pass: None,
            listen_onion: default_listen_onion(),
            listen_port: default_listen_port(),
            onion_proxy: None,
            data_dir: default_data_dir(),
            key_type: default_key_type(),
            reconnect_initial_secs: default_reconnect_initial_secs(),
            reconnect_growth: default_reconnect_growth(),
            reconnect_max_secs: default_reconnect_max_secs(),
            reconnect_jitter: 0.0,
            stop_timeout_secs: default_stop_timeout_secs(),
            loglevel: LogLevel::default(),
            logfile: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTarget`] if `control_target` is not a socket
    /// address, [`Error::Config`] for any other invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.control_target.parse::<SocketAddr>().is_err() {
            return Err(Error::InvalidTarget(self.control_target.clone()));
        }
        if let Some(ref proxy) = self.onion_proxy {
            if proxy.parse::<SocketAddr>().is_err() {
                return Err(Error::Config(format!(
                    "onion_proxy is not a socket address: {}",
                    proxy
                )));
            }
        }
        if self.key_type.is_empty() || self.key_type.contains(char::is_whitespace) {
            return Err(Error::Config(format!("invalid key_type: {:?}", self.key_type)));
        }
        if !(self.reconnect_initial_secs.is_finite() && self.reconnect_initial_secs > 0.0) {
            return Err(Error::Config(
                "reconnect_initial_secs must be positive".to_string(),
            ));
        }
        if !(self.reconnect_growth.is_finite() && self.reconnect_growth >= 1.0) {
            return Err(Error::Config(
                "reconnect_growth must be at least 1".to_string(),
            ));
        }
        if !(self.reconnect_max_secs.is_finite()
            && self.reconnect_max_secs >= self.reconnect_initial_secs)
        {
            return Err(Error::Config(
                "reconnect_max_secs must be >= reconnect_initial_secs".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(Error::Config(
                "reconnect_jitter must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a hostname in `control_target` to an IP address.
    ///
    /// Targets that already are socket addresses are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTarget`] if the target cannot be resolved.
    pub fn resolve_control_target(&mut self) -> Result<()> {
        if self.control_target.parse::<SocketAddr>().is_err() {
            let addr = self
                .control_target
                .to_socket_addrs()
                .map_err(|e| {
                    Error::InvalidTarget(format!("{} ({})", self.control_target, e))
                })?
                .next()
                .ok_or_else(|| Error::InvalidTarget(self.control_target.clone()))?;
            self.control_target = addr.to_string();
        }
        Ok(())
    }
}

/// Command-line arguments for onion-control.
///
/// Arguments override configuration file values.
///
/// # Options
///
/// | Option | Description |
/// |--------|-------------|
/// | `--config <FILE>` | Configuration file [env: ONION_CONTROL_CONFIG] [default: onion-control.conf] |
/// | `--generate_config <FILE>` | Write default config to file and exit |
/// | `--control <HOST:PORT>` | Control port address [env: ONION_CONTROL_TARGET] |
/// | `--control-pass <PASS>` | Control port password [env: ONION_CONTROL_PASS] |
/// | `--listen-port <PORT>` | Node listening port |
/// | `--no-listen-onion` | Do not provision an onion service |
/// | `--onion-proxy <HOST:PORT>` | External onion proxy |
/// | `--data-dir <DIR>` | Directory for the private key [env: ONION_CONTROL_DATA_DIR] |
/// | `--key-type <TYPE>` | Key type for new services |
/// | `--loglevel <LEVEL>` | DEBUG, INFO, NOTICE, WARN, ERROR |
/// | `--logfile <FILE>` | Log to file instead of stdout (":syslog:" for syslog) |
///
/// # Examples
///
/// ```bash
/// onion-control --control 127.0.0.1:9051 --listen-port 31569
/// onion-control --control-pass mypassword --loglevel DEBUG
/// onion-control --generate_config onion-control.conf
/// ```
#[derive(Parser, Debug, Default)]
#[command(name = "onion-control")]
#[command(about = "Provision and maintain an onion service through a Tor control port")]
#[command(version)]
pub struct CliArgs {
    /// Path to configuration file.
    #[arg(
        long = "config",
        env = "ONION_CONTROL_CONFIG",
        default_value = "onion-control.conf"
    )]
    pub config_file: PathBuf,

    /// Write default config to file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Control port address (host:port).
    #[arg(long = "control", env = "ONION_CONTROL_TARGET")]
    pub control_target: Option<String>,

    /// Control port password.
    ///
    /// Used only if the daemon offers HASHEDPASSWORD authentication.
    #[arg(long, env = "ONION_CONTROL_PASS", hide_env_values = true)]
    pub control_pass: Option<String>,

    /// Node listening port; the onion service maps this port to 127.0.0.1.
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Do not provision an onion service.
    #[arg(long)]
    pub no_listen_onion: bool,

    /// Externally configured onion proxy (host:port).
    ///
    /// When set, the daemon's SOCKS port is not installed as the onion proxy.
    #[arg(long)]
    pub onion_proxy: Option<String>,

    /// Directory holding the onion service private key.
    #[arg(long, env = "ONION_CONTROL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Key type requested for a new onion service.
    #[arg(long)]
    pub key_type: Option<String>,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout (use ":syslog:" for syslog).
    #[arg(long)]
    pub logfile: Option<String>,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref target) = self.control_target {
            config.control_target = target.clone();
        }
        if let Some(ref control_pass) = self.control_pass {
            config.control_pass = Some(control_pass.clone());
        }
        if let Some(listen_port) = self.listen_port {
            config.listen_port = listen_port;
        }
        if self.no_listen_onion {
            config.listen_onion = false;
        }
        if let Some(ref proxy) = self.onion_proxy {
            config.onion_proxy = Some(proxy.clone());
        }
        if let Some(ref data_dir) = self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(ref key_type) = self.key_type {
            config.key_type = key_type.clone();
        }
        if let Some(ref loglevel) = self.loglevel {
            if let Ok(level) = loglevel.parse() {
                config.loglevel = level;
            }
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
    }
}

/// Load configuration from file and CLI arguments.
///
/// This function implements the configuration loading order:
/// 1. Start with defaults
/// 2. Apply config file if it exists
/// 3. Apply CLI arguments (override)
///
/// # Errors
///
/// Returns [`Error::Config`] or [`Error::InvalidTarget`] if configuration is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.resolve_control_target()?;
    config.validate()?;

    Ok(config)
}
