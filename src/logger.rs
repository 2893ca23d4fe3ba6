//! Logging infrastructure for onion-control.
//!
//! This module provides logging functionality using the tracing ecosystem.
//! It supports output to stdout, files, and syslog, with configurable log levels.
//!
//! # Log Levels
//!
//! From most to least verbose:
//!
//! | Level | Description | Use Case |
//! |-------|-------------|----------|
//! | [`Debug`](crate::LogLevel::Debug) | Protocol steps, reply codes | Development only |
//! | [`Info`](crate::LogLevel::Info) | Informational messages | Verbose operation |
//! | [`Notice`](crate::LogLevel::Notice) | Service advertised or withdrawn | Default level |
//! | [`Warn`](crate::LogLevel::Warn) | Failed provisioning attempts | Potential issues |
//! | [`Error`](crate::LogLevel::Error) | Error conditions | Failures |
//!
//! Messages about the control protocol carry a `tor: ` prefix. Text that came
//! from the daemon is passed through [`sanitize`](crate::reply::sanitize)
//! before it is logged, and secrets (password, cookie, nonces, private key)
//! are never logged.
//!
//! # Example
//!
//! ```rust,no_run
//! use onion_control::{LogLevel, logger};
//!
//! // Log to stdout (default)
//! logger::init(LogLevel::Notice, None).unwrap();
//!
//! logger::plog(LogLevel::Notice, "onion-control started");
//! logger::plog(LogLevel::Debug, "tor: Successfully connected!");
//! ```
//!
//! Other destinations:
//!
//! ```rust,no_run
//! use onion_control::{LogLevel, logger};
//!
//! // Log to a file (appends)
//! logger::init(LogLevel::Debug, Some("/var/log/onion-control.log")).unwrap();
//!
//! // Log to syslog
//! logger::init(LogLevel::Notice, Some(":syslog:")).unwrap();
//! ```
//!
//! # What This Module Does NOT Do
//!
//! - **Log rotation**: Use external tools like logrotate
//! - **Structured logging**: Currently outputs plain text only

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the logging system.
///
/// This function sets up the tracing subscriber with the specified log level
/// and output destination. It should be called once at application startup.
/// Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - The minimum log level to output
/// * `logfile` - Output destination:
///   - `None` - Log to stdout with ANSI colors
///   - `Some(":syslog:")` - Log to system syslog
///   - `Some(path)` - Log to file at the specified path
///
/// # Returns
///
/// `Ok(())` on success, or an error if initialization fails.
///
/// # Errors
///
/// Returns [`Error::Config`] if:
/// - The log file path has no file name, or the file cannot be opened
/// - No syslog socket is found (Linux: `/dev/log`, macOS: `/var/run/syslog`)
/// - The tracing subscriber cannot be set (usually means already initialized)
///
/// # Notes
///
/// - The `RUST_LOG` environment variable can override the configured level
/// - File logging appends to existing files
/// - Syslog messages are prefixed with "onion-control:"
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(":syslog:") => {
            init_syslog(env_filter)?;
        }
        Some(path) => {
            init_file_logger(path, env_filter)?;
        }
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

fn init_syslog(env_filter: EnvFilter) -> Result<()> {
    let syslog_path = if Path::new("/dev/log").exists() {
        "/dev/log"
    } else if Path::new("/var/run/syslog").exists() {
        "/var/run/syslog"
    } else {
        return Err(Error::Config("no syslog socket found".to_string()));
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(move || SyslogWriter {
            socket: UnixDatagram::unbound()
                .and_then(|sock| sock.connect(syslog_path).map(|()| sock))
                .ok(),
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;

    Ok(())
}

/// Sends each formatted event as one datagram; drops output if the socket
/// could not be opened.
struct SyslogWriter {
    socket: Option<UnixDatagram>,
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(ref socket) = self.socket {
            let msg = format!("onion-control: {}", String::from_utf8_lossy(buf));
            socket.send(msg.as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_file_logger(path: &str, env_filter: EnvFilter) -> Result<()> {
    let path = Path::new(path);
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::Config(format!("invalid log file: {}", path.display())))?;
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(directory)
        .map_err(|e| Error::Config(format!("cannot open log file {}: {}", path.display(), e)))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(appender)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;

    Ok(())
}

/// Log a message at the specified level.
///
/// Maps [`LogLevel`] onto the tracing macros.
///
/// # Arguments
///
/// * `level` - The log level for this message
/// * `message` - The message to log
///
/// # Level Mapping
///
/// | LogLevel | tracing macro |
/// |----------|---------------|
/// | Debug | `debug!` |
/// | Info | `info!` |
/// | Notice | `info!` |
/// | Warn | `warn!` |
/// | Error | `error!` |
///
/// # Example
///
/// ```rust
/// use onion_control::{LogLevel, logger};
///
/// logger::plog(LogLevel::Notice, "Advertising local address abc.onion:31569");
/// logger::plog(LogLevel::Warn, "tor: authentication failed (515)");
/// ```
///
/// # Notes
///
/// - Messages are only output if the level meets the configured minimum
/// - Notice maps to `info!` since tracing doesn't have a notice level
///
/// # See Also
///
/// - [`init`] - Initialize logging before calling plog
/// - [`plog_fmt`](crate::plog_fmt) - Formatted logging macro
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info => info!("{}", message),
        LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

/// Log a formatted message at the specified level.
///
/// This macro provides printf-style formatting for log messages.
///
/// # Example
///
/// ```rust
/// use onion_control::{LogLevel, plog_fmt};
///
/// plog_fmt!(LogLevel::Debug, "tor: Connected to Tor version {}", "0.4.8.9");
/// plog_fmt!(LogLevel::Notice, "Removed local address {}:{}", "abc.onion", 31569);
/// ```
#[macro_export]
macro_rules! plog_fmt {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::plog($level, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_writer_prefixes_messages() {
        let (tx, rx) = UnixDatagram::pair().unwrap();
        let mut writer = SyslogWriter { socket: Some(tx) };
        assert_eq!(writer.write(b"tor: Successfully connected!").unwrap(), 28);

        let mut buf = [0u8; 128];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"onion-control: tor: Successfully connected!");
    }

    #[test]
    fn test_syslog_writer_without_socket_discards() {
        let mut writer = SyslogWriter { socket: None };
        assert_eq!(writer.write(b"dropped").unwrap(), 7);
        writer.flush().unwrap();
    }
}
