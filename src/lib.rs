//! # Statshm - Zero-Coupling Shared-Memory Telemetry
//!
//! A Rust library for publishing process counters through plain shared
//! memory, paired with an unprivileged monitor that reads them live. The
//! two sides never talk to each other: producers write machine words into
//! a **self-describing segment**, and any process that can read the file
//! can render the counters.
//!
//! ## The Problem
//!
//! Instrumenting a long-running process usually means linking a metrics
//! pipeline into it: an exporter thread, a network endpoint, a push
//! gateway. All of that is coupling. The observed process must cooperate,
//! stay healthy enough to export, and carry the dependency forever. When
//! it wedges or dies, the telemetry dies with it, which is exactly when
//! you wanted to look at it.
//!
//! ## The Solution: Self-Describing Segments
//!
//! A producer creates one file per counter registry under `/dev/shm`,
//! laid out so that a reader needs nothing but the file itself:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header        path, name, creation time, region geometry     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Descriptors   one fixed-width name per counter column        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Counters      counter_num × stat_num atomic machine words    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Updating a counter is a single atomic store into mapped memory. No
//! syscall, no serialization, no lock. The monitor maps the same file
//! read-only and loads the words whenever it feels like it.
//!
//! ### Design Principles
//!
//! 1. **Zero coupling**: producers never learn whether anyone is
//!    watching. The monitor never writes producer memory and needs no
//!    privileges beyond read access to the segment directory.
//!
//! 2. **Self-describing layout**: the header carries the geometry and
//!    the descriptor table carries the column names, so a monitor built
//!    years later can still render a segment it has never seen.
//!
//! 3. **Liveness without cooperation**: each producer holds a `flock` on
//!    a lock file for its lifetime. A producer is considered alive only
//!    while the kernel still records that lock in `/proc/locks`, so
//!    crashed producers disappear from the monitor within a refresh.
//!
//! 4. **Plain atomic words**: counters are `AtomicUsize` values accessed
//!    with sequentially consistent loads and stores. Torn rows across
//!    counters are accepted; each individual word is always consistent.
//!
//! ## Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`layout`] | Segment geometry, headers, file-name scheme |
//! | [`shm`] | Creating and attaching memory-mapped segments |
//! | [`lock`] | Producer lifetime locks |
//! | [`registry`] | Producer-side counter registry |
//! | [`counterset`] | Handle to one allocated row of counters |
//! | [`perf`] | Ready-made network-transport counter groups |
//! | [`monitor`] | Discovery, liveness, rates and rendering (feature `monitor`) |
//!
//! ## Quick Start
//!
//! ```rust
//! use statshm::Registry;
//!
//! # let dir = tempfile::tempdir().unwrap();
//! // Counters live under /dev/shm unless a root override is given.
//! let registry = Registry::new(1, "worker_stats", 4, ["pid", "jobs_done", "bytes_out"])
//!     .with_root(dir.path());
//! registry.init()?;
//!
//! // One row of counters per worker, allocated at startup.
//! let set = registry.alloc()?;
//! set.set("pid", std::process::id() as usize)?;
//!
//! // On the hot path: one atomic add each.
//! set.inc("jobs_done")?;
//! set.add("bytes_out", 4096)?;
//! # Ok::<(), statshm::Error>(())
//! ```
//!
//! Every live registry of every process on the machine is now visible to
//! `statmon`, the bundled monitor binary:
//!
//! ```text
//! $ statmon
//! == 2026-08-25 | 14:02:07 +0200 ==
//! worker_stats
//! ------------
//! ┌───────┬───────────┬───────────┐
//! │ pid   │ jobs_done │ bytes_out │
//! ├───────┼───────────┼───────────┤
//! │ 71205 │ 1942      │ 7955456   │
//! └───────┴───────────┴───────────┘
//! ```
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `monitor` | yes | The [`monitor`] module and the `statmon` binary |
//! | `serde` | no | `Serialize` on monitor snapshot and report types |
//! | `json` | no | JSON output mode for `statmon` |
//! | `full` | no | Everything above |
//!
//! ## Crash Behavior
//!
//! Segments outlive their producers on purpose: the monitor keeps a
//! crashed producer's last counter values mapped until the next refresh
//! notices the kernel lock is gone. Nothing has to be cleaned up by
//! hand; a registry that is dropped normally zeroes and unlinks its own
//! segment, and stale files from crashed producers are ignored because
//! their pid no longer holds a lock.

pub mod counterset;
pub mod error;
pub mod layout;
pub mod lock;
pub mod perf;
pub mod registry;
pub mod shm;

#[cfg(feature = "monitor")]
pub mod monitor;

pub use counterset::{CounterKey, CounterSet};
pub use error::{Error, Result};
pub use perf::PerfStats;
pub use registry::Registry;
