//! socket-runner - drive a worker process from the command line.
//!
//! Reads one command per stdin line (a bare name like `PING`, or a JSON
//! `{"name": ..., "args": {...}}` object), executes it through the bridge
//! and prints the returned payload. Shuts the channel down on EOF.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use socket_runner::{Bridge, Command, RunnerConfig, SocketChannel};

fn main() -> Result<()> {
    let config = RunnerConfig::from_env().context("Invalid configuration")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_mode.filter_directive().into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
    config.report_fallbacks();

    tracing::info!("Starting socket-runner v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Connecting to {}", config.address);

    let mut bridge = Bridge::new(config.clone())?;
    let channel = SocketChannel::from_config(&config, bridge.events());
    bridge.start_channel(channel)?;
    tracing::info!("Connected to {}", config.address);

    let result = run_commands(&mut bridge);

    // Shut down even if a command failed, then report the failure.
    let shutdown = bridge.shutdown();
    if let Err(e) = result {
        tracing::error!("Runner error: {}", e);
        if let Err(shutdown_err) = shutdown {
            tracing::warn!("Shutdown after error failed: {}", shutdown_err);
        }
        return Err(e);
    }
    shutdown?;

    tracing::info!("socket-runner exited cleanly");
    Ok(())
}

/// Execute every command read from stdin, printing each payload.
fn run_commands(bridge: &mut Bridge) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line.context("Failed to read command")?;
        if line.trim().is_empty() {
            continue;
        }

        let command = Command::parse_line(&line)
            .with_context(|| format!("Invalid command: {}", line.trim()))?;
        let payload = bridge.execute(&command)?;
        writeln!(stdout, "{}", payload)?;
        stdout.flush()?;
    }

    Ok(())
}
