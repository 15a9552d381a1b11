//! stammer-relay: a single-threaded TCP relay
//!
//! Programs selected with `--mode`:
//! - echo: send every byte back to the client that sent it
//! - proxy: relay each client to a fixed backend
//! - stammer: relay with fragmented, delayed sends to shake out
//!   partial-read bugs in the endpoints
//! - client: load generator that checks every byte comes back once
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod error;
mod loadgen;
mod runtime;

use config::{Config, Mode};
use error::RelayError;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(RelayError::from(e).exit_code());
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        listen = %config.listen,
        server = %config.server,
        buffer_capacity = config.buffer_capacity,
        "Starting stammer-relay"
    );

    let result = match config.mode {
        Mode::Client => loadgen::run(&config).map(|_| ()),
        Mode::Echo | Mode::Proxy | Mode::Stammer => runtime::run(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Exiting");
            ExitCode::from(e.exit_code())
        }
    }
}
