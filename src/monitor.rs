//! Live, read-only observation of producer counter segments.
//!
//! The monitor never talks to the producers. It finds their segments on
//! disk, decides which producers are alive from kernel lock state, maps
//! the live segments read-only and renders their counters in place. A
//! producer that crashes simply stops being listed a refresh later;
//! nothing has to be cleaned up by hand.
//!
//! [`Monitor::run`] drives the whole loop:
//!
//! ```no_run
//! use statshm::monitor::{Monitor, Options};
//!
//! let mut monitor = Monitor::new(Options::default());
//! monitor.run();
//! ```
//!
//! The pieces are usable on their own: [`discovery`] scans and attaches,
//! [`liveness`] decides who is alive, [`rate`] turns counters into
//! throughput and [`render`] formats for a terminal.

pub mod discovery;
pub mod liveness;
pub mod rate;
pub mod render;

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::layout::SHM_ROOT;
use crate::perf::bw;

use self::discovery::{snapshot_group, GroupSnapshot, SegmentTable};
use self::rate::BwTracker;

/// How far apart full directory rescans are spaced, regardless of the
/// render interval.
const RESCAN_SPACING: Duration = Duration::from_secs(10);

/// What the monitor watches and how it reports.
#[derive(Clone, Debug)]
pub struct Options {
    /// Directory holding segment and lock files.
    pub root: PathBuf,
    /// Only watch these pids. Empty means every producer found in `root`.
    pub pids: Vec<u32>,
    /// Report peer throughput instead of counter tables.
    pub show_bw: bool,
    /// Refresh interval. Defaults to one second for tables and ten
    /// milliseconds for throughput sampling.
    pub interval: Option<Duration>,
    /// Emit one JSON object per group instead of tables.
    #[cfg(feature = "json")]
    pub json: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root: PathBuf::from(SHM_ROOT),
            pids: Vec::new(),
            show_bw: false,
            interval: None,
            #[cfg(feature = "json")]
            json: false,
        }
    }
}

impl Options {
    fn effective_interval(&self) -> Duration {
        let default = if self.show_bw {
            Duration::from_millis(10)
        } else {
            Duration::from_secs(1)
        };
        self.interval.unwrap_or(default).max(Duration::from_millis(1))
    }
}

/// The monitor loop: discovery, liveness and rendering glued together.
pub struct Monitor {
    opts: Options,
    filter: Vec<u32>,
    table: SegmentTable,
    tracker: BwTracker,
    interval: Duration,
    rescan_every: u64,
    ticks: u64,
}

impl Monitor {
    pub fn new(opts: Options) -> Self {
        let interval = opts.effective_interval();
        let rescan_every = (RESCAN_SPACING.as_nanos() / interval.as_nanos()).max(1) as u64;
        Self {
            filter: opts.pids.clone(),
            table: SegmentTable::new(),
            tracker: BwTracker::new(),
            interval,
            rescan_every,
            ticks: 0,
            opts,
        }
    }

    /// Runs forever, refreshing on a fixed cadence. The first tick comes
    /// quickly so an interactive user is not staring at a blank screen.
    pub fn run(&mut self) -> ! {
        let mut delay = Duration::from_millis(10);
        loop {
            std::thread::sleep(delay);
            delay = self.interval;
            self.tick();
        }
    }

    /// One scheduled step: rescan if due, then render or sample.
    pub fn tick(&mut self) {
        if self.ticks % self.rescan_every == 0 {
            if let Err(err) = self.refresh() {
                warn!(%err, "segment rescan failed");
            }
            if self.table.is_empty() {
                info!(root = %self.opts.root.display(), "no live producer segments, waiting");
            }
        }
        self.ticks += 1;
        if self.opts.show_bw {
            self.bw_tick();
        } else {
            self.table_tick();
        }
    }

    /// Reconciles the attached segments with the world.
    ///
    /// Order matters: liveness is decided first from one reading of the
    /// kernel lock table, dead producers are evicted, new segments of
    /// live producers attached, and segments whose file disappeared
    /// dropped last.
    pub fn refresh(&mut self) -> Result<()> {
        let kernel = liveness::kernel_lock_pids()?;
        let live = liveness::live_pids(&self.opts.root, &mut self.filter, &kernel)?;
        discovery::evict_dead(&mut self.table, &kernel);
        discovery::scan(&self.opts.root, &live, &mut self.table)?;
        discovery::evict_unlinked(&self.opts.root, &mut self.table);
        Ok(())
    }

    /// Snapshot of every attached group, throughput group included.
    pub fn snapshots(&self) -> Vec<GroupSnapshot> {
        self.table
            .iter()
            .map(|(name, segments)| snapshot_group(name, segments))
            .collect()
    }

    /// Rendered table per group, skipping the peer-traffic group, which
    /// only makes sense as rates.
    pub fn render_tables(&self) -> Vec<String> {
        self.table
            .iter()
            .filter(|(name, _)| name.as_str() != bw::GROUP)
            .map(|(name, segments)| render::group_table(&snapshot_group(name, segments)))
            .collect()
    }

    fn table_tick(&self) {
        #[cfg(feature = "json")]
        if self.opts.json {
            for snapshot in self.snapshots() {
                match serde_json::to_string(&snapshot) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(%err, "snapshot serialization failed"),
                }
            }
            return;
        }
        // The banner prints every tick, attached segments or not.
        println!("{}", render::tick_block(&self.render_tables()));
    }

    fn bw_tick(&mut self) {
        let rows = self
            .table
            .get(bw::GROUP)
            .map(|segments| snapshot_group(bw::GROUP, segments).rows)
            .unwrap_or_default();
        self.tracker.record(&rows);
        if let Some(reports) = self.tracker.take_report() {
            let lines: Vec<String> = reports.iter().map(render::bw_line).collect();
            println!("{}", render::tick_block(&lines));
        }
    }
}
