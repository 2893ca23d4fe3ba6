//! Error types for onion-control.
//!
//! This module defines the [`enum@Error`] enum representing all failure conditions
//! in the library. Inside the control worker none of these cross the event loop:
//! every failure is logged where it is detected and the worker falls back to the
//! idle state, relying on the reconnect policy to try again. Errors are returned
//! to callers only from the outer surfaces (configuration loading, starting the
//! worker, key persistence).
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io               ◄── File/socket I/O failures
//!   ├── Config           ◄── Invalid configuration
//!   ├── InvalidTarget    ◄── Control target is not host:port
//!   ├── NotConnected     ◄── Command issued without a live connection
//!   ├── LineTooLong      ◄── Peer exceeded the unframed input limit
//!   ├── Protocol         ◄── Malformed or unexpected reply
//!   ├── Authentication   ◄── No method, bad nonce, server hash mismatch
//!   ├── Cookie           ◄── Cookie file unreadable or wrong size
//!   ├── Provisioning     ◄── ADD_ONION rejected by the daemon
//!   ├── KeyStore         ◄── Private key could not be persisted
//!   └── AlreadyRunning   ◄── A control worker is already active
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Recoverable | Retry | Recommended Action |
//! |-------|-------------|-------|-------------------|
//! | [`Io`](Error::Io) | Sometimes | Yes (backoff) | Check permissions, daemon status |
//! | [`Config`](Error::Config) | No | No | Fix configuration file |
//! | [`InvalidTarget`](Error::InvalidTarget) | No | No | Fix `control_target` |
//! | [`NotConnected`](Error::NotConnected) | Yes | On reconnect | Wait for the connection |
//! | [`LineTooLong`](Error::LineTooLong) | Yes | Yes (backoff) | Inspect the daemon |
//! | [`Protocol`](Error::Protocol) | Yes | Yes (backoff) | Check daemon version |
//! | [`Authentication`](Error::Authentication) | Sometimes | Yes (backoff) | Check password / cookie |
//! | [`Cookie`](Error::Cookie) | Sometimes | Yes (backoff) | Check cookie file permissions |
//! | [`Provisioning`](Error::Provisioning) | Sometimes | Yes (backoff) | Upgrade the daemon |
//! | [`KeyStore`](Error::KeyStore) | Yes | No | Check data directory permissions |
//! | [`AlreadyRunning`](Error::AlreadyRunning) | No | No | Stop the running worker first |

use thiserror::Error;

/// Errors that can occur during onion-control operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file or network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// Invalid configuration values or TOML parsing failures. Not recoverable
    /// without user intervention.
    #[error("configuration error: {0}")]
    Config(String),

    /// The control target could not be parsed as a socket address.
    ///
    /// Returned by [`ControlConnection::connect`](crate::connection::ControlConnection::connect)
    /// before any state change happens.
    #[error("invalid control target: {0}")]
    InvalidTarget(String),

    /// A command was issued while the control connection was not established.
    #[error("not connected to the control port")]
    NotConnected,

    /// Buffered input without a line terminator exceeded the maximum line length.
    #[error("control line exceeds {0} bytes")]
    LineTooLong(usize),

    /// Malformed or unexpected reply from the control port.
    ///
    /// The message carries sanitized reply text only.
    #[error("control protocol error: {0}")]
    Protocol(String),

    /// Authentication could not be completed.
    ///
    /// Covers the absence of a mutually supported method, a malformed server
    /// nonce, a server hash that does not match the cookie, and a rejected
    /// AUTHENTICATE command.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The SAFECOOKIE cookie file could not be used.
    #[error("cookie error: {0}")]
    Cookie(String),

    /// The daemon refused to create the onion service.
    #[error("onion service provisioning failed: {0}")]
    Provisioning(String),

    /// Private key material could not be read or written.
    ///
    /// # Recovery
    ///
    /// Persistence failures are not fatal: the service keeps running with the
    /// key held in memory and a fresh key is requested on the next start.
    #[error("key store error: {0}")]
    KeyStore(String),

    /// A control worker is already active in this process.
    #[error("control worker already running")]
    AlreadyRunning,
}

/// Result type alias for onion-control operations.
pub type Result<T> = std::result::Result<T, Error>;
