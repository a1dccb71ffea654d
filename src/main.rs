//! tracepipe: Print kernel tracepoint events as they fire
//!
//! Enables one event category, streams the decoded trace pipe lines to stdout and
//! turns tracing back off on Ctrl-C or when the trace pipe ends.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tracepipe::{EventTrace, TracefsPaths, DEFAULT_CHANNEL_CAPACITY, DEFAULT_TRACING_DIR};

#[derive(Debug, Parser)]
#[command(name = "tracepipe")]
#[command(about = "Stream kernel tracepoint events from the ftrace trace pipe")]
#[command(version)]
struct Command {
    /// Event category to trace, as laid out under events/ in tracefs
    #[arg(default_value = "sunrpc/xprt_transmit")]
    category: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print one JSON object per event instead of text
    #[arg(long)]
    json: bool,

    /// Number of events buffered before the reader waits on output
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    capacity: usize,

    /// Root of the tracing filesystem
    #[arg(long, default_value = DEFAULT_TRACING_DIR)]
    tracing_dir: PathBuf,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbose);

    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("Not running as root, the tracing switches are usually root only");
    }

    let trace = Arc::new(
        EventTrace::with_paths(&opts.category, TracefsPaths::new(&opts.tracing_dir))?
            .with_capacity(opts.capacity),
    );

    // Installed before enable so an interrupt at any point leaves the switches off.
    let handler_trace = trace.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted...");
        handler_trace.disable();
    })
    .context("Failed to set Ctrl-C handler")?;

    trace
        .enable()
        .with_context(|| format!("Failed to enable tracing for '{}'", opts.category))?;

    let events = match trace.event_source() {
        Ok(events) => events,
        Err(e) => {
            trace.disable();
            return Err(e).context("Failed to start reading the trace pipe");
        }
    };

    eprintln!("Tracing {}, press Ctrl-C to stop", opts.category);
    let mut stdout = io::stdout().lock();
    for event in events {
        let written = if opts.json {
            serde_json::to_string(&event)
                .map_err(io::Error::from)
                .and_then(|line| writeln!(stdout, "{line}"))
        } else {
            writeln!(stdout, "{event}")
        };
        if let Err(e) = written {
            tracing::debug!("Stopping output: {}", e);
            break;
        }
    }

    trace.disable();
    Ok(())
}
