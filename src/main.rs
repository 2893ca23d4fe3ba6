//! onion-control CLI application entry point.
//!
//! Runs the control worker as a standalone process: the local node is
//! represented by an in-memory address registry and proxy table, and the
//! onion service key is kept under the data directory.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌─────────────────┐
//!   │  Parse CLI Args │ ◄── clap parses command-line arguments
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐       ┌─────────────────┐
//!   │ --generate_config│────▶ │ Write default   │────▶ Exit
//!   │    specified?    │       │ config & exit   │
//!   └────────┬─────────┘       └─────────────────┘
//!            │ No
//!            ▼
//!   ┌─────────────────┐
//!   │  Load Config    │ ◄── Defaults → File → CLI → Env
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Initialize      │ ◄── Set up tracing subscriber
//!   │   Logging       │
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Start worker    │ ◄── OnionControl::start()
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Wait for signal │ ◄── SIGINT / SIGTERM
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Stop worker     │ ◄── withdraws the advertised address
//!   └─────────────────┘
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error (see stderr for details) |
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `ONION_CONTROL_CONFIG` | Path to config file (equivalent to `--config`) |
//! | `ONION_CONTROL_TARGET` | Control port address (equivalent to `--control`) |
//! | `ONION_CONTROL_PASS` | Control port password (equivalent to `--control-pass`) |
//! | `ONION_CONTROL_DATA_DIR` | Key directory (equivalent to `--data-dir`) |

use clap::Parser;
use std::process::ExitCode;

use onion_control::{
    config, logger, plog_fmt, CliArgs, Config, FileKeyStore, LocalAddresses, LogLevel,
    NodeContext, OnionControl, ProxyTable, VERSION,
};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> onion_control::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let config = Config::default();
        let toml = config.to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    logger::init(config.loglevel, config.logfile.as_deref())?;

    plog_fmt!(LogLevel::Notice, "onion-control {} starting", VERSION);
    plog_fmt!(LogLevel::Debug, "Control target: {}", config.control_target);
    plog_fmt!(LogLevel::Debug, "Data directory: {}", config.data_dir.display());

    if !config.listen_onion {
        logger::plog(LogLevel::Notice, "Onion listening disabled, nothing to do");
        return Ok(());
    }

    let addresses = LocalAddresses::default();
    let node = NodeContext {
        registry: Box::new(addresses.clone()),
        network: Box::new(ProxyTable::default()),
        keys: Box::new(FileKeyStore::new(&config.data_dir)),
    };
    let control = OnionControl::start(&config, node)?;

    wait_for_shutdown().await?;
    logger::plog(LogLevel::Notice, "Shutting down");

    tokio::task::spawn_blocking(move || control.stop())
        .await
        .map_err(|e| onion_control::Error::Io(std::io::Error::other(e)))?;

    for address in addresses.addresses() {
        plog_fmt!(LogLevel::Warn, "Address {} still advertised at exit", address);
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
