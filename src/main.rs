//! btetto: convert bpftrace JSON output into a Perfetto trace.
//!
//! ```text
//! bpftrace -f json script.bt | btetto -o trace.binpb
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use btetto::driver::convert;
use btetto::input::open_input;
use btetto::validate::validate_trace;

#[derive(Parser)]
#[command(name = "btetto")]
#[command(about = "Convert bpftrace JSON output into a Perfetto protobuf trace")]
#[command(version)]
struct Cli {
    /// bpftrace JSON output to read (defaults to stdin)
    input: Option<PathBuf>,

    /// Where to write the trace
    #[arg(short, long, default_value = "bpftrace_trace.binpb")]
    output: PathBuf,

    /// Check the finished trace for structural problems
    #[arg(long)]
    validate: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let reader = open_input(cli.input.as_deref())?;
    let (container, stats) = convert(reader, &stop)?;
    if stats.interrupted {
        info!("Interrupted, writing what was collected so far");
    }
    info!(
        "Processed {} records ({} skipped), {} packets",
        stats.processed,
        stats.skipped,
        container.len()
    );

    container.write_to_file(&cli.output)?;
    info!("Trace written to {}", cli.output.display());

    if cli.validate {
        let result = validate_trace(container.trace());
        for warning in &result.warnings {
            warn!("{}", warning);
        }
        for err in &result.errors {
            error!("{}", err);
        }
        if result.has_errors() {
            bail!("Trace failed validation with {} errors", result.errors.len());
        }
        info!("Trace passed validation");
    }

    Ok(())
}
