//! Producer liveness, derived without cooperation from the producers.
//!
//! A pid counts as alive when two independent signals agree: a lock file in
//! the segment directory names it, and `/proc/locks` shows the kernel still
//! holding a lock for it. The first signal alone would trust stale files
//! left by crashed processes; the second alone would count every lock
//! holder on the host. Their intersection is exactly the set of producers
//! that created a lock file and have not died since.
//!
//! Pid reuse between two scans can still fool this check. That window is
//! accepted; see the crate documentation.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use crate::layout::{parse_lock_name, LOCK_PREFIX};

/// Kernel advisory-lock table.
pub const PROC_LOCKS: &str = "/proc/locks";

/// Pids of every lock holder the kernel currently records.
pub fn kernel_lock_pids() -> io::Result<HashSet<u32>> {
    Ok(parse_proc_locks(&std::fs::read_to_string(PROC_LOCKS)?))
}

/// Extracts the pid column (5th whitespace token) of each lock line.
///
/// Lines that do not fit the format, including OFD locks reported with
/// pid -1, are skipped.
fn parse_proc_locks(text: &str) -> HashSet<u32> {
    text.lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .filter_map(|pid| pid.parse().ok())
        .collect()
}

/// Pids named by lock files in the segment directory.
pub fn lock_file_pids(root: &Path) -> io::Result<Vec<u32>> {
    let mut pids = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(LOCK_PREFIX) {
            continue;
        }
        if let Some((_, pid)) = parse_lock_name(name) {
            pids.push(pid);
        }
    }
    Ok(pids)
}

/// The set of live producer pids.
///
/// With a non-empty `filter`, only those pids are considered and the
/// filter permanently drops pids the kernel no longer knows: a watched
/// process that exits stays gone, and an empty filter result means idle,
/// never a fallback to watching everyone. Without a filter, the lock
/// files in `root` decide who is a candidate.
pub fn live_pids(root: &Path, filter: &mut Vec<u32>, kernel: &HashSet<u32>) -> io::Result<HashSet<u32>> {
    if !filter.is_empty() {
        filter.retain(|pid| kernel.contains(pid));
        return Ok(filter.iter().copied().collect());
    }
    Ok(lock_file_pids(root)?
        .into_iter()
        .filter(|pid| kernel.contains(pid))
        .collect())
}
