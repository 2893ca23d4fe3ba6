//! # onion-control
//!
//! A Tor control-port client that publishes a node's listening port as an
//! onion service.
//!
//! # Overview
//!
//! onion-control connects to a running Tor daemon's control port,
//! authenticates, and asks Tor to create an onion service with `ADD_ONION`
//! forwarding to the node's local listening port. The resulting
//! `<service-id>.onion:<port>` address is advertised to the node, and the
//! service private key is persisted so the address survives restarts.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`api`] | [`OnionControl`] handle running the worker thread |
//! | [`auth`] | PROTOCOLINFO parsing, method selection, SAFECOOKIE |
//! | [`backoff`] | Reconnect delay schedule |
//! | [`config`] | Configuration management (TOML, CLI, environment) |
//! | [`connection`] | Line framing, command queue, notifications |
//! | [`control`] | Worker event loop and single-instance guard |
//! | [`controller`] | Provisioning state machine |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`logger`] | Logging infrastructure using tracing |
//! | [`node`] | Address registry, proxy settings and key storage |
//! | [`reply`] | Reply grammar and string quoting |
//!
//! # Protocol Flow
//!
//! ```text
//! client                                   tor
//!   │── PROTOCOLINFO 1 ──────────────────────▶│
//!   │◀── 250-AUTH METHODS=... COOKIEFILE=... ─│
//!   │── AUTHCHALLENGE SAFECOOKIE <nonce> ────▶│   (SAFECOOKIE only)
//!   │◀── 250 AUTHCHALLENGE SERVERHASH=... ────│
//!   │── AUTHENTICATE [<secret>] ─────────────▶│
//!   │◀── 250 OK ──────────────────────────────│
//!   │── ADD_ONION <key> Port=P,127.0.0.1:P ──▶│
//!   │◀── 250-ServiceID=... 250-PrivateKey=... │
//! ```
//!
//! # What This Library Does NOT Do
//!
//! - **Run Tor**: a daemon with an enabled control port must already be running
//! - **SOCKS proxying**: the node's own networking uses the configured proxy
//! - **Control over Unix sockets**: only TCP control targets are supported
//!
//! # Quick Start
//!
//! ## As a Library
//!
//! ```rust,no_run
//! use onion_control::{Config, FileKeyStore, LocalAddresses, NodeContext, OnionControl, ProxyTable};
//!
//! fn main() -> onion_control::Result<()> {
//!     let config = Config::default();
//!     let addresses = LocalAddresses::default();
//!     let node = NodeContext {
//!         registry: Box::new(addresses.clone()),
//!         network: Box::new(ProxyTable::default()),
//!         keys: Box::new(FileKeyStore::new(&config.data_dir)),
//!     };
//!
//!     let control = OnionControl::start(&config, node)?;
//!     // ... later ...
//!     control.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Run with default settings
//! onion-control
//!
//! # Connect to a specific control port
//! onion-control --control 127.0.0.1:9151 --control-pass hunter2
//!
//! # Generate default configuration file
//! onion-control --generate_config onion-control.conf
//! ```
//!
//! # Configuration
//!
//! Configuration can be loaded from multiple sources in order of precedence:
//!
//! ```text
//! ┌─────────────────┐
//! │   CLI Arguments │ ◄── Highest priority (overrides all)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Environment   │ ◄── ONION_CONTROL_TARGET, ONION_CONTROL_PASS, ...
//! │    Variables    │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Config File   │ ◄── TOML file (default: onion-control.conf)
//! │     (TOML)      │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Defaults     │
//! └─────────────────┘
//! ```
//!
//! See [`Config`] for all available options.
//!
//! # Security Considerations
//!
//! - **Memory Safety**: passwords, cookies and keys are zeroized after use
//! - **File Permissions**: the private key file is written with 0600 permissions
//! - **Log Hygiene**: `AUTHENTICATE` arguments and `PrivateKey=` values never reach the logs
//!
//! # See Also
//!
//! - [Tor Control Protocol Specification](https://spec.torproject.org/control-spec) - Protocol reference

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod api;
pub mod auth;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod control;
pub mod controller;
pub mod error;
pub mod logger;
pub mod node;
pub mod reply;

pub use api::OnionControl;
pub use auth::{AuthMethod, ProtocolInfo, SafeCookie, SecurePassword};
pub use backoff::Backoff;
pub use config::{CliArgs, Config, LogLevel};
pub use connection::{
    ConnectionEvent, ConnectionState, ControlConnection, Dialer, TcpDialer, MAX_LINE_LENGTH,
};
pub use control::{is_control_active, ActiveGuard, ControlWorker};
pub use controller::{
    Command, ControllerSettings, ControllerState, NodeContext, ServiceController, Step,
};
pub use error::{Error, Result};
pub use node::{
    AddressKind, AddressRegistry, FileKeyStore, KeyStore, LocalAddresses, Network,
    NetworkSettings, OnionAddress, ProxyTable,
};
pub use reply::{ControlReply, RawReplyMapping, ReplyMapping};

/// Crate version, as reported in the startup banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
