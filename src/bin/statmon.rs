//! Terminal monitor for shared-memory counter segments.
//!
//! Attaches read-only to the segments of live producers and renders
//! their counters once per interval. Needs no privileges beyond read
//! access to the segment directory and never writes producer memory.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use statshm::layout::SHM_ROOT;
use statshm::monitor::{Monitor, Options};

/// Watch the shared-memory counters of live producer processes.
///
/// Producers are discovered through their segment files and considered
/// alive only while the kernel still records their liveness lock.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Only watch these producer pids (comma separated or repeated).
    #[arg(short, long, value_name = "PID", value_delimiter = ',')]
    pid: Vec<u32>,

    /// Report peer throughput instead of counter tables.
    #[arg(long)]
    show_bw: bool,

    /// Refresh interval in nanoseconds (default: 1s tables, 10ms throughput).
    #[arg(long, value_name = "NANOS")]
    sample_interval: Option<u64>,

    /// Directory holding segment and lock files.
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Emit one JSON object per group instead of tables.
    #[cfg(feature = "json")]
    #[arg(long)]
    json: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let opts = Options {
        root: args.root.unwrap_or_else(|| PathBuf::from(SHM_ROOT)),
        pids: args.pid,
        show_bw: args.show_bw,
        interval: args.sample_interval.map(Duration::from_nanos),
        #[cfg(feature = "json")]
        json: args.json,
    };
    Monitor::new(opts).run();
}
