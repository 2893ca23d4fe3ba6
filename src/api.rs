//! High-level API for onion-control.
//!
//! This module provides [`OnionControl`], the handle an embedding node uses to
//! run the control worker on its own thread.
//!
//! # Lifecycle
//!
//! ```text
//! start(config, node) ──▶ worker thread: current-thread runtime
//!                                      └─ ControlWorker::run()
//! interrupt()         ──▶ wake the worker; it tears down and exits
//! stop()              ──▶ interrupt, then wait up to stop_timeout_secs
//! ```
//!
//! Only one worker may run per process. A second [`OnionControl::start`]
//! while the first is alive fails with [`Error::AlreadyRunning`](crate::Error::AlreadyRunning).
//!
//! # Example
//!
//! ```rust,no_run
//! use onion_control::{Config, LocalAddresses, NodeContext, OnionControl, ProxyTable, FileKeyStore};
//!
//! fn main() -> onion_control::Result<()> {
//!     let config = Config::default();
//!     let node = NodeContext {
//!         registry: Box::new(LocalAddresses::default()),
//!         network: Box::new(ProxyTable::default()),
//!         keys: Box::new(FileKeyStore::new(&config.data_dir)),
//!     };
//!
//!     let control = OnionControl::start(&config, node)?;
//!     // ... run the node ...
//!     control.stop();
//!     Ok(())
//! }
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::{Config, LogLevel};
use crate::control::{ActiveGuard, ControlWorker};
use crate::controller::NodeContext;
use crate::error::Result;
use crate::logger::plog;

const WORKER_THREAD_NAME: &str = "torcontrol";

/// Handle to a running control worker thread.
///
/// Dropping the handle interrupts the worker without waiting for it.
pub struct OnionControl {
    shutdown: Arc<Notify>,
    done: mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl OnionControl {
    /// Starts the control worker on a dedicated thread.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`](crate::Error::AlreadyRunning) if a worker is already active
    /// - [`Error::Io`](crate::Error::Io) if the runtime or the thread cannot be created
    pub fn start(config: &Config, node: NodeContext) -> Result<Self> {
        let guard = ActiveGuard::acquire()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let mut worker = ControlWorker::from_config(config, node);
        let shutdown = Arc::new(Notify::new());
        let (done_tx, done) = mpsc::channel();

        let notify = shutdown.clone();
        let thread = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let _guard = guard;
                runtime.block_on(worker.run(&notify));
                drop(worker);
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            shutdown,
            done,
            thread: Some(thread),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        })
    }

    /// Asks the worker to tear down and exit. Returns immediately.
    pub fn interrupt(&self) {
        self.shutdown.notify_one();
    }

    /// Interrupts the worker and waits for it to finish.
    ///
    /// If the worker does not finish within `stop_timeout_secs` the thread
    /// is detached and a warning logged.
    pub fn stop(mut self) {
        self.interrupt();
        let Some(thread) = self.thread.take() else {
            return;
        };

        match self.done.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    plog(LogLevel::Error, "tor: Control worker thread panicked");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                plog(
                    LogLevel::Warn,
                    &format!(
                        "tor: Control worker did not stop within {:.1}s, detaching",
                        self.stop_timeout.as_secs_f64()
                    ),
                );
            }
        }
    }
}

impl Drop for OnionControl {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.interrupt();
        }
    }
}
