//! tcp-relay
//!
//! Layer-4 TCP relay.
//!
//! This service:
//! - Loads listener ports and backend pools from a TOML file
//! - Binds every configured port, or none at all
//! - Picks a random backend from the port's pool per accepted connection
//! - Relays bytes in both directions until either side closes

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use tcp_relay::{logging, server, Reactor, RelayConfig, StopReason};

/// Layer-4 TCP relay.
#[derive(Debug, Parser)]
#[command(name = "tcp-relay", version, about)]
struct Cli {
    /// Path to the relay configuration file (TOML).
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RelayConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    logging::init(&config.log_level, config.log_format)?;

    info!("Starting tcp-relay");
    info!(
        config = %cli.config.display(),
        ports = ?config.ports(),
        bind_host = %config.bind_host,
        "Configuration loaded"
    );

    let reactor = Reactor::new().context("failed to build reactor")?;

    let bound = match server::start(&config, &reactor) {
        Ok(bound) => bound,
        Err(e) => {
            error!(error = %e, reason = e.reason_code(), "Startup failed");
            return Err(e.into());
        }
    };

    for listener in &bound {
        info!(port = listener.port, bind_addr = %listener.local_addr, "Listening");
    }

    match reactor.run() {
        StopReason::Fatal(e) => {
            error!(error = %e, reason = e.reason_code(), "Relay stopped on fatal error");
            Err(e.into())
        }
        reason => {
            info!(reason = ?reason, "Relay shut down");
            Ok(())
        }
    }
}
