//! Segment discovery and attachment for the monitor.
//!
//! Segments are found by scanning the root directory for files whose name
//! parses as a segment name, attached read-only, and grouped by registry
//! name. A group maps to one table on screen; within a group each attached
//! segment contributes the occupied rows of one producer.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::Ordering::SeqCst;

use tracing::{debug, warn};

use crate::error::Result;
use crate::layout::{parse_segment_name, SegmentLayout, SegmentName};
use crate::shm::SegmentMap;

/// Attached segments grouped by registry name, in stable name order.
pub type SegmentTable = BTreeMap<String, Vec<AttachedSegment>>;

/// Point-in-time view of one group: column names plus the occupied rows
/// of every attached segment, in attach order.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Clone, Debug)]
pub struct GroupSnapshot {
    pub group: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<usize>>,
}

/// Merges the segments of one group into a [`GroupSnapshot`].
///
/// Column names come from the first segment; producers of the same group
/// share a schema, so the rest agree.
pub fn snapshot_group(name: &str, segments: &[AttachedSegment]) -> GroupSnapshot {
    GroupSnapshot {
        group: name.to_string(),
        columns: segments
            .first()
            .map(|seg| seg.columns().to_vec())
            .unwrap_or_default(),
        rows: segments
            .iter()
            .flat_map(AttachedSegment::occupied_rows)
            .collect(),
    }
}

/// One producer segment mapped read-only.
pub struct AttachedSegment {
    file: String,
    info: SegmentName,
    layout: SegmentLayout,
    columns: Vec<String>,
    map: SegmentMap,
}

impl AttachedSegment {
    /// Opens and maps the segment file `file` under `root`.
    ///
    /// The header is cross-checked against the file size before anything
    /// is read from the body. A header name that disagrees with the file
    /// name is reported but tolerated; the file name is what discovery
    /// keyed on, so it wins.
    pub fn attach(root: &Path, info: SegmentName, file: String) -> Result<Self> {
        let map = SegmentMap::attach(&root.join(&file))?;
        let layout = map.header().validate(map.len())?;
        map.words(&layout)?;
        let header_name = map.header().name();
        if header_name != info.name {
            warn!(file = %file, header = %header_name, "segment header name differs from file name");
        }
        let columns = map.descriptors(&layout).iter().map(|d| d.name()).collect();
        Ok(Self { file, info, layout, columns, map })
    }

    /// File name within the root directory.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Producer pid parsed from the file name.
    pub fn pid(&self) -> u32 {
        self.info.pid
    }

    /// Registry name parsed from the file name.
    pub fn group(&self) -> &str {
        &self.info.name
    }

    /// Counter names, in column order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// Snapshot of every counter set, one row of word values per set.
    ///
    /// The rows are read without producer coordination, so values within a
    /// row may come from different instants. Each individual read is
    /// atomic.
    pub fn slot_values(&self) -> Vec<Vec<usize>> {
        let Ok(words) = self.map.words(&self.layout) else {
            return Vec::new();
        };
        words
            .chunks(self.layout.counter_num)
            .map(|slot| slot.iter().map(|w| w.load(SeqCst)).collect())
            .collect()
    }

    /// Rows whose first counter is non-zero.
    ///
    /// Producers record their pid in the first counter of every set they
    /// allocate, and freed sets are zeroed, so a zero first word marks a
    /// vacant row.
    pub fn occupied_rows(&self) -> Vec<Vec<usize>> {
        self.slot_values()
            .into_iter()
            .filter(|row| row.first().copied().unwrap_or(0) != 0)
            .collect()
    }
}

/// Attaches every not-yet-known segment of a live producer under `root`.
///
/// Files already present in `table` (matched by exact file name within
/// their group) are left alone, so repeated scans are cheap and never
/// remap. Attach failures are logged and skipped; a half-written header
/// is picked up on a later scan once the producer finishes it.
pub fn scan(root: &Path, live: &HashSet<u32>, table: &mut SegmentTable) -> io::Result<()> {
    for entry in std::fs::read_dir(root)? {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(file) = name.to_str() else { continue };
        let Some(info) = parse_segment_name(file) else { continue };
        if !live.contains(&info.pid) {
            continue;
        }
        let known = table
            .get(&info.name)
            .is_some_and(|segs| segs.iter().any(|s| s.file == file));
        if known {
            continue;
        }
        match AttachedSegment::attach(root, info, file.to_string()) {
            Ok(seg) => {
                debug!(file, group = seg.group(), "attached segment");
                table.entry(seg.group().to_string()).or_default().push(seg);
            }
            Err(err) => debug!(file, %err, "skipping segment"),
        }
    }
    Ok(())
}

/// Drops segments whose producer no longer holds a kernel lock.
pub fn evict_dead(table: &mut SegmentTable, kernel: &HashSet<u32>) {
    for segments in table.values_mut() {
        segments.retain(|seg| {
            let keep = kernel.contains(&seg.pid());
            if !keep {
                debug!(file = seg.file(), pid = seg.pid(), "producer gone, dropping segment");
            }
            keep
        });
    }
    table.retain(|_, segments| !segments.is_empty());
}

/// Drops segments whose backing file has been unlinked.
pub fn evict_unlinked(root: &Path, table: &mut SegmentTable) {
    for segments in table.values_mut() {
        segments.retain(|seg| {
            let keep = root.join(seg.file()).exists();
            if !keep {
                debug!(file = seg.file(), "segment file unlinked, dropping");
            }
            keep
        });
    }
    table.retain(|_, segments| !segments.is_empty());
}
