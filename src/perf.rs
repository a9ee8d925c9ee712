//! Well-known counter groups for network transport instrumentation, plus
//! the one-per-process bootstrap that publishes them.
//!
//! Two groups are part of the cross-process contract and must keep their
//! names and index order:
//!
//! | Group | Slots | Counters |
//! |-------|-------|----------|
//! | [`ib::GROUP`] | 1 | pid, rank, cq/qp/mr counts, completions, completion errors, fifo post/recv counts, tx bytes |
//! | [`bw::GROUP`] | 1 | pid, rank, local_rank, world_size, local_size, then per-peer `tx_rank<i>`/`cpl_rank<i>` pairs |
//!
//! The bandwidth group's width depends on the world size, which is why its
//! schema is built at runtime and why readers locate per-peer counters
//! through [`bw::tx_bytes_index`] and [`bw::cpl_bytes_index`] instead of
//! hard-coded offsets.
//!
//! [`PerfStats`] wires the whole producer side together: process lock,
//! both registries, one counter set each, identity counters seeded. It is
//! deliberately an explicit handle the embedding application owns; there
//! is no hidden global.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::counterset::CounterSet;
use crate::error::Result;
use crate::layout::SHM_ROOT;
use crate::lock::ProcessLock;
use crate::registry::Registry;

/// Registry id shared by both well-known groups.
pub const PERF_STATS_ID: u32 = 0;

/// Kill switch: any value whose first byte is greater than `'0'` disables
/// all publication for the process.
pub const DISABLE_ENV: &str = "STATSHM_DISABLE";

/// Counter names shared across the well-known groups.
pub mod counter {
    pub const PID: &str = "pid";
    pub const RANK: &str = "rank";
    pub const LOCAL_RANK: &str = "local_rank";
    pub const WORLD_SIZE: &str = "world_size";
    pub const LOCAL_SIZE: &str = "local_size";
    pub const CQ_COUNT: &str = "cq_count";
    pub const QP_COUNT: &str = "qp_count";
    pub const MR_COUNT: &str = "mr_count";
    pub const CPL_COUNT: &str = "cpl_count";
    pub const CPL_ERR_COUNT: &str = "cpl_err_count";
    pub const FIFO_POST_COUNT: &str = "fifo_post_count";
    pub const FIFO_RECV_COUNT: &str = "fifo_recv_count";
    pub const TX_BYTES: &str = "tx_bytes";
}

/// The fixed-width transport counter group.
pub mod ib {
    use super::counter;

    pub const GROUP: &str = "unet_ib_stats";
    pub const SLOTS: usize = 1;

    /// Schema, in index order. The index constants below must match.
    pub const COUNTERS: [&str; 10] = [
        counter::PID,
        counter::RANK,
        counter::CQ_COUNT,
        counter::QP_COUNT,
        counter::MR_COUNT,
        counter::CPL_COUNT,
        counter::CPL_ERR_COUNT,
        counter::FIFO_POST_COUNT,
        counter::FIFO_RECV_COUNT,
        counter::TX_BYTES,
    ];

    pub const PID: usize = 0;
    pub const RANK: usize = 1;
    pub const CQ_COUNT: usize = 2;
    pub const QP_COUNT: usize = 3;
    pub const MR_COUNT: usize = 4;
    pub const CPL_COUNT: usize = 5;
    pub const CPL_ERR_COUNT: usize = 6;
    pub const FIFO_POST_COUNT: usize = 7;
    pub const FIFO_RECV_COUNT: usize = 8;
    pub const TX_BYTES: usize = 9;
}

/// The per-peer bandwidth counter group, sized by world size.
pub mod bw {
    use super::counter;

    pub const GROUP: &str = "unet_bw_stats";
    pub const SLOTS: usize = 1;

    pub const PID: usize = 0;
    pub const RANK: usize = 1;
    pub const LOCAL_RANK: usize = 2;
    pub const WORLD_SIZE: usize = 3;
    pub const LOCAL_SIZE: usize = 4;

    /// Index of the first per-peer counter.
    pub const OFFSET: usize = 5;

    /// Full schema for a given world size: the five identity counters,
    /// then a `tx_rank<i>`/`cpl_rank<i>` pair per peer.
    pub fn counters(world_size: i32) -> Vec<String> {
        let mut list = vec![
            counter::PID.to_string(),
            counter::RANK.to_string(),
            counter::LOCAL_RANK.to_string(),
            counter::WORLD_SIZE.to_string(),
            counter::LOCAL_SIZE.to_string(),
        ];
        for i in 0..world_size.max(0) {
            list.push(format!("tx_rank{i}"));
            list.push(format!("cpl_rank{i}"));
        }
        list
    }

    /// Index of the posted-bytes counter towards `rank`.
    pub fn tx_bytes_index(rank: usize) -> usize {
        OFFSET + rank * 2
    }

    /// Index of the completed-bytes counter towards `rank`.
    pub fn cpl_bytes_index(rank: usize) -> usize {
        OFFSET + rank * 2 + 1
    }
}

/// Rank geometry of the process, taken from the launcher environment.
///
/// Each field falls back from the torchrun-style variable to the OpenMPI
/// one and is `-1` when neither is set non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankGeometry {
    pub rank: i32,
    pub local_rank: i32,
    pub world_size: i32,
    pub local_size: i32,
}

impl RankGeometry {
    /// Reads `RANK`, `LOCAL_RANK`, `WORLD_SIZE` and `LOCAL_WORLD_SIZE`,
    /// with their `OMPI_COMM_WORLD_*` equivalents as fallback.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |primary: &str, fallback: &str| -> i32 {
            lookup(primary)
                .filter(|v| !v.is_empty())
                .or_else(|| lookup(fallback).filter(|v| !v.is_empty()))
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1)
        };
        Self {
            rank: get("RANK", "OMPI_COMM_WORLD_RANK"),
            local_rank: get("LOCAL_RANK", "OMPI_COMM_WORLD_LOCAL_RANK"),
            world_size: get("WORLD_SIZE", "OMPI_COMM_WORLD_SIZE"),
            local_size: get("LOCAL_WORLD_SIZE", "OMPI_COMM_WORLD_LOCAL_SIZE"),
        }
    }

    /// Whether the process runs under a rank-assigning launcher.
    pub fn has_rank(&self) -> bool {
        self.rank >= 0
    }
}

fn disabled_by(value: Option<String>) -> bool {
    value.is_some_and(|v| v.as_bytes().first().is_some_and(|b| *b > b'0'))
}

/// Short process name: first line of `/proc/self/comm`, falling back to
/// the executable file name.
fn process_name(pid: u32) -> String {
    if let Ok(comm) = std::fs::read_to_string(format!("/proc/{pid}/comm")) {
        let comm = comm.trim();
        if !comm.is_empty() {
            return comm.to_string();
        }
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Everything one producer process publishes: lock file, transport
/// counters, and, under a rank-assigning launcher, bandwidth counters.
///
/// Dropping it frees the counter sets, removes both segments and releases
/// the lock file, in that order, so the liveness signal disappears last.
pub struct PerfStats {
    bw: Option<CounterSet>,
    ib: CounterSet,
    bw_registry: Option<Registry>,
    ib_registry: Registry,
    _lock: ProcessLock,
    geometry: RankGeometry,
    proc_name: String,
}

impl PerfStats {
    /// Sets up publication under [`SHM_ROOT`].
    ///
    /// Returns `Ok(None)` when [`DISABLE_ENV`] switches publication off.
    /// Errors wire through from lock, registry or counter setup; embedding
    /// applications normally log them and carry on unpublished.
    pub fn init() -> Result<Option<Self>> {
        Self::init_at(SHM_ROOT)
    }

    /// Same as [`init`](Self::init) with an explicit segment directory.
    pub fn init_at(root: impl Into<PathBuf>) -> Result<Option<Self>> {
        if disabled_by(std::env::var(DISABLE_ENV).ok()) {
            debug!("stats publication disabled by environment");
            return Ok(None);
        }

        let root = root.into();
        let pid = std::process::id();
        let proc_name = process_name(pid);
        let geometry = RankGeometry::from_env();

        let lock = ProcessLock::acquire(&root, &proc_name, pid).map_err(|err| {
            warn!(%err, "failed to set up liveness lock");
            err
        })?;

        let ib_registry =
            Registry::new(PERF_STATS_ID, ib::GROUP, ib::SLOTS, ib::COUNTERS).with_root(&root);
        let ib = Self::publish_identity(&ib_registry, pid, geometry.rank).map_err(|err| {
            warn!(group = ib::GROUP, %err, "failed to publish counters");
            err
        })?;

        let (bw_registry, bw) = if geometry.has_rank() {
            let registry = Registry::new(
                PERF_STATS_ID,
                bw::GROUP,
                bw::SLOTS,
                bw::counters(geometry.world_size),
            )
            .with_root(&root);
            let set = Self::publish_identity(&registry, pid, geometry.rank).map_err(|err| {
                warn!(group = bw::GROUP, %err, "failed to publish counters");
                err
            })?;
            set.set(counter::LOCAL_RANK, geometry.local_rank as usize)?;
            set.set(counter::WORLD_SIZE, geometry.world_size as usize)?;
            set.set(counter::LOCAL_SIZE, geometry.local_size as usize)?;
            (Some(registry), Some(set))
        } else {
            (None, None)
        };

        Ok(Some(Self {
            bw,
            ib,
            bw_registry,
            ib_registry,
            _lock: lock,
            geometry,
            proc_name,
        }))
    }

    fn publish_identity(registry: &Registry, pid: u32, rank: i32) -> Result<CounterSet> {
        registry.init()?;
        let set = registry.alloc()?;
        set.set(counter::PID, pid as usize)?;
        // A rank of -1 stores as the wrapped word, matching what readers
        // of the raw segment expect for unranked processes.
        set.set(counter::RANK, rank as usize)?;
        Ok(set)
    }

    /// Transport counter set. Always present.
    pub fn ib(&self) -> &CounterSet {
        &self.ib
    }

    /// Bandwidth counter set; absent without a launcher-assigned rank.
    pub fn bw(&self) -> Option<&CounterSet> {
        self.bw.as_ref()
    }

    /// The transport group registry.
    pub fn ib_registry(&self) -> &Registry {
        &self.ib_registry
    }

    /// The bandwidth group registry, when publishing bandwidth.
    pub fn bw_registry(&self) -> Option<&Registry> {
        self.bw_registry.as_ref()
    }

    /// Rank geometry captured at setup.
    pub fn geometry(&self) -> RankGeometry {
        self.geometry
    }

    /// Process name used in the lock file.
    pub fn proc_name(&self) -> &str {
        &self.proc_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ib_schema_indices_match_names() {
        assert_eq!(ib::COUNTERS[ib::PID], counter::PID);
        assert_eq!(ib::COUNTERS[ib::RANK], counter::RANK);
        assert_eq!(ib::COUNTERS[ib::CPL_COUNT], counter::CPL_COUNT);
        assert_eq!(ib::COUNTERS[ib::TX_BYTES], counter::TX_BYTES);
        assert_eq!(ib::COUNTERS.len(), 10);
    }

    #[test]
    fn test_bw_schema_layout() {
        let counters = bw::counters(3);
        assert_eq!(counters.len(), bw::OFFSET + 6);
        assert_eq!(counters[bw::LOCAL_RANK], counter::LOCAL_RANK);
        assert_eq!(counters[bw::tx_bytes_index(0)], "tx_rank0");
        assert_eq!(counters[bw::cpl_bytes_index(0)], "cpl_rank0");
        assert_eq!(counters[bw::tx_bytes_index(2)], "tx_rank2");
        assert_eq!(counters[bw::cpl_bytes_index(2)], "cpl_rank2");
        // An unknown world size publishes the identity counters alone.
        assert_eq!(bw::counters(-1).len(), bw::OFFSET);
    }

    #[test]
    fn test_rank_geometry_fallback_order() {
        let torch = RankGeometry::from_lookup(|key| match key {
            "RANK" => Some("3".to_string()),
            "OMPI_COMM_WORLD_RANK" => Some("9".to_string()),
            "WORLD_SIZE" => Some("8".to_string()),
            _ => None,
        });
        assert_eq!(torch.rank, 3);
        assert_eq!(torch.world_size, 8);
        assert_eq!(torch.local_rank, -1);
        assert!(torch.has_rank());

        let ompi = RankGeometry::from_lookup(|key| match key {
            "RANK" => Some(String::new()),
            "OMPI_COMM_WORLD_RANK" => Some("5".to_string()),
            _ => None,
        });
        assert_eq!(ompi.rank, 5);

        let none = RankGeometry::from_lookup(|_| None);
        assert!(!none.has_rank());
        assert_eq!(none.world_size, -1);
    }

    #[test]
    fn test_malformed_rank_counts_as_unset() {
        // A set-but-unparsable primary yields -1; it neither becomes
        // rank 0 nor falls through to the OpenMPI variable.
        let geometry = RankGeometry::from_lookup(|key| match key {
            "RANK" => Some("abc".to_string()),
            "OMPI_COMM_WORLD_RANK" => Some("5".to_string()),
            _ => None,
        });
        assert_eq!(geometry.rank, -1);
        assert!(!geometry.has_rank());
    }

    #[test]
    fn test_disable_values() {
        assert!(disabled_by(Some("1".to_string())));
        assert!(disabled_by(Some("9".to_string())));
        assert!(disabled_by(Some("yes".to_string())));
        assert!(!disabled_by(Some("0".to_string())));
        assert!(!disabled_by(Some(String::new())));
        assert!(!disabled_by(None));
    }

    #[test]
    fn test_init_publishes_identity() {
        let dir = tempfile::tempdir().unwrap();
        let perf = PerfStats::init_at(dir.path()).unwrap().unwrap();

        assert_eq!(
            perf.ib().get(ib::PID).unwrap(),
            std::process::id() as usize
        );
        assert!(perf.ib_registry().path().unwrap().exists());
        assert!(!perf.proc_name().is_empty());

        // The lock file sits next to the segments.
        let locks: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(crate::layout::LOCK_PREFIX)
            })
            .collect();
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_drop_cleans_namespace() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _perf = PerfStats::init_at(dir.path()).unwrap().unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
