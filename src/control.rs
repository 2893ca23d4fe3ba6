//! Control worker loop.
//!
//! This module ties the [`ControlConnection`], the [`ServiceController`] and
//! the reconnect [`Backoff`] together into a single event loop.
//!
//! # Event Loop
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     ControlWorker::run()                       │
//! │                                                                │
//! │  connect(target)                                               │
//! │  loop select! {                                                │
//! │    shutdown notified   ──▶ break                               │
//! │    reconnect deadline  ──▶ connect(target)                     │
//! │    connection event:                                           │
//! │      Connected         ──▶ reset backoff, send PROTOCOLINFO 1  │
//! │      Reply(step, r)    ──▶ controller.handle_reply, send next  │
//! │      Disconnected      ──▶ unregister address,                 │
//! │                            deadline = now + backoff delay      │
//! │  }                                                             │
//! │  teardown: disconnect, unregister address                      │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one task, so connection, controller and timer state
//! need no locking. The only state shared with other threads is the
//! process-wide [`ActiveGuard`] flag.
//!
//! # Reconnection
//!
//! | Event | Backoff |
//! |-------|---------|
//! | Connected | reset to the initial delay |
//! | Disconnected | wait the current delay, then grow it |
//! | `connect` rejects the target | logged, nothing scheduled |

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};

use crate::backoff::Backoff;
use crate::config::{Config, LogLevel};
use crate::connection::{ConnectionEvent, ControlConnection, Dialer, TcpDialer};
use crate::controller::{Command, ControllerSettings, NodeContext, ServiceController, Step};
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::plog_fmt;
use crate::reply::ControlReply;

/// Set while a control worker is running in this process.
///
/// Claimed with a compare-and-swap (acquire) and released with a release
/// store, so a thread that observes `false` also observes the previous
/// worker's teardown.
static CONTROL_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Returns true while a control worker holds the [`ActiveGuard`].
pub fn is_control_active() -> bool {
    CONTROL_ACTIVE.load(Ordering::Acquire)
}

/// Ownership of the process-wide "control worker running" flag.
///
/// Released on drop.
#[derive(Debug)]
pub struct ActiveGuard {
    _private: (),
}

impl ActiveGuard {
    /// Claims the flag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if another worker holds it.
    pub fn acquire() -> Result<Self> {
        CONTROL_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ActiveGuard { _private: () })
            .map_err(|_| Error::AlreadyRunning)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        CONTROL_ACTIVE.store(false, Ordering::Release);
    }
}

/// Owns one control connection and keeps the onion service provisioned on it.
pub struct ControlWorker<D: Dialer = TcpDialer> {
    target: String,
    conn: ControlConnection<Step, D>,
    controller: ServiceController,
    backoff: Backoff,
}

impl ControlWorker<TcpDialer> {
    /// Builds a TCP worker from configuration.
    pub fn from_config(config: &Config, node: NodeContext) -> Self {
        Self::new(
            TcpDialer,
            config.control_target.clone(),
            ServiceController::new(ControllerSettings::from_config(config), node),
            Backoff::from_config(config),
        )
    }
}

impl<D: Dialer> ControlWorker<D> {
    /// Builds a worker over an arbitrary dialer.
    pub fn new(
        dialer: D,
        target: String,
        controller: ServiceController,
        backoff: Backoff,
    ) -> Self {
        Self {
            target,
            conn: ControlConnection::new(dialer),
            controller,
            backoff,
        }
    }

    /// The provisioning state machine.
    pub fn controller(&self) -> &ServiceController {
        &self.controller
    }

    /// The underlying control connection.
    pub fn connection(&self) -> &ControlConnection<Step, D> {
        &self.conn
    }

    /// Receives the daemon's asynchronous notifications.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ControlReply> {
        self.conn.subscribe()
    }

    /// Runs until `shutdown` is notified, then tears down the connection and
    /// withdraws any advertised address.
    pub async fn run(&mut self, shutdown: &Notify) {
        self.connect();
        let mut retry_at: Option<Instant> = None;

        loop {
            let deadline = retry_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    plog(LogLevel::Debug, "tor: Control worker interrupted");
                    break;
                }
                _ = sleep_until(deadline), if retry_at.is_some() => {
                    retry_at = None;
                    self.connect();
                }
                event = self.conn.next_event() => match event {
                    ConnectionEvent::Connected => {
                        self.backoff.reset();
                        let command = self.controller.on_connected();
                        self.send(command);
                    }
                    ConnectionEvent::Reply(step, reply) => {
                        if let Some(command) = self.controller.handle_reply(step, &reply) {
                            self.send(command);
                        }
                    }
                    ConnectionEvent::Disconnected => {
                        self.controller.on_disconnected();
                        let delay = self.backoff.next_delay(&mut rand::thread_rng());
                        plog_fmt!(
                            LogLevel::Debug,
                            "tor: Not connected to Tor control port {}, trying to reconnect in {:.1}s",
                            self.target,
                            delay.as_secs_f64()
                        );
                        retry_at = Some(Instant::now() + delay);
                    }
                },
            }
        }

        self.conn.disconnect();
        self.controller.on_disconnected();
    }

    fn connect(&mut self) {
        if let Err(e) = self.conn.connect(&self.target) {
            plog_fmt!(
                LogLevel::Warn,
                "tor: Initiating connection to Tor control port {} failed: {}",
                self.target,
                e
            );
        }
    }

    fn send(&mut self, command: Command) {
        if let Err(e) = self.conn.send_command(&command.line, command.step) {
            plog_fmt!(
                LogLevel::Warn,
                "tor: Error sending {:?} command: {}",
                command.step,
                e
            );
        }
    }
}
