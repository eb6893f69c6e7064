//! Telemetry Export

mod config;
mod error;
mod export;
mod parser;
mod schema;

use anyhow::{Context, Result}; // alias std::result::Result with dynamic error type
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Endpoint};
use crate::error::{debug_error, debug_error_enabled};
use crate::export::Exporter;

/// The program's main entry point.
fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(config.debug);
    debug_error_enabled(config.debug);

    let (send_shutdown, recv_shutdown) = mpsc::channel::<()>();

    // When we receive a SIGINT (or SIGTERM) signal, begin exiting.
    let mut signalled = false;
    ctrlc::set_handler(move || {
        // The first time we receive the signal, shutdown gracefully
        if !signalled {
            signalled = true;
            send_shutdown.send(()).ok();
        }
        // The second time we receive the signal, shutdown immediately
        else {
            std::process::exit(1);
        }
    })
    .context("installing signal handler")?;

    run(&config, recv_shutdown)
}

/// Installs the log subscriber; `RUST_LOG` overrides the default level
fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_output(output: &Endpoint) -> Result<Box<dyn Write>> {
    match output {
        Endpoint::Standard => Ok(Box::new(io::stdout())),
        Endpoint::Path(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            Ok(Box::new(file))
        }
    }
}

/// The export loop
fn run(config: &Config, shutdown: mpsc::Receiver<()>) -> Result<()> {
    let mut exporter = Exporter::new(config);
    let mut output = open_output(&config.output)?;
    tracing::info!(
        input = ?config.input,
        output = ?config.output,
        varint = config.varint.as_str(),
        peer_version = config.peer_version,
        "starting export"
    );

    let interval = match config.interval {
        Some(interval) => interval,
        None => {
            // A single cycle reports its failure through the exit code
            let input = exporter.read_input()?;
            exporter.export(&input, &mut output)?;
            if config.debug_interval.is_some() {
                exporter.encoder().stats().publish();
            }
            return Ok(());
        }
    };

    let mut last_published = Instant::now();
    loop {
        let start = Instant::now();
        let result = exporter
            .read_input()
            .and_then(|input| exporter.export(&input, &mut output));
        if let Err(err) = result {
            debug_error(err);
        }

        // Every debug interval, log debug information
        if let Some(debug_interval) = config.debug_interval {
            if last_published.elapsed() >= debug_interval {
                exporter.encoder().stats().publish();
                last_published = Instant::now();
            }
        }

        // Sleep until the next export interval, or until we are asked to stop
        let delay = interval.checked_sub(start.elapsed()).unwrap_or_default();
        match shutdown.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!(
        schema_version = exporter.schema_version(),
        peer_version = exporter.peer_version(),
        "stopping export"
    );
    exporter.encoder().stats().publish();
    Ok(())
}
