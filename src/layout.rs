//! Binary layout of a counter segment.
//!
//! A segment is a single file (normally under `/dev/shm`) with three
//! consecutive regions, all sized at creation time and never moved:
//!
//! ```text
//! [ Header ][ Descriptor; counter_num ][ word; counter_num * stat_num ]
//! ```
//!
//! The header repeats every size the reader needs, so a monitor can parse a
//! segment knowing nothing but this module: it reads the header, learns how
//! many counters per set and how many sets exist, reads the descriptor names
//! and then addresses any counter word by plain offset arithmetic.
//!
//! Counters are machine words accessed atomically from both sides; on the
//! 64-bit platforms this crate targets that is an 8-byte word, which keeps
//! the format word-for-word identical across producer and monitor builds.
//!
//! This module also owns the namespace conventions: where segments live and
//! how segment and lock files are named, so producers and monitors agree
//! without ever talking to each other.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};

/// Default directory scanned for segments and lock files.
pub const SHM_ROOT: &str = "/dev/shm";

/// Leading tag of every segment file name.
pub const SEGMENT_PREFIX: &str = ".statshm.";

/// Leading tag of every process lock file name.
pub const LOCK_PREFIX: &str = ".statshm_lock.";

/// Capacity of the header's embedded segment path, including the NUL.
pub const PATH_LEN: usize = 256;

/// Capacity of the header's creation-time stamp, including the NUL.
pub const STAMP_LEN: usize = 128;

/// Capacity of the header's and each descriptor's name, including the NUL.
pub const NAME_LEN: usize = 128;

/// Size in bytes of one counter word.
pub const COUNTER_BYTES: usize = std::mem::size_of::<usize>();

/// Required alignment of the counter region.
pub const COUNTER_ALIGN: usize = std::mem::align_of::<usize>();

/// Fixed-size segment header, stored at offset 0.
///
/// All strings are NUL-terminated byte buffers; all sizes are in bytes and
/// describe the very segment the header lives in.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct Header {
    /// Absolute path the segment was created under.
    pub shm_path: [u8; PATH_LEN],
    /// Human-readable creation time stamp.
    pub created: [u8; STAMP_LEN],
    /// Registry name, repeated in the file name.
    pub name: [u8; NAME_LEN],
    /// Counters per counter set.
    pub counter_num: i32,
    /// Number of counter sets (slots).
    pub stat_num: i32,
    /// Byte size of this header.
    pub header_size: i32,
    /// Byte size of the descriptor region.
    pub desc_size: i32,
    /// Byte size of the counter region.
    pub stats_size: i32,
    /// Byte size of the whole segment.
    pub total_size: i32,
}

/// One per counter: the counter's name, shared by every slot.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct Descriptor {
    pub name: [u8; NAME_LEN],
}

impl Descriptor {
    /// Builds a descriptor for one counter name.
    pub fn for_name(name: &str) -> Self {
        let mut desc = Self::zeroed();
        write_cstr(&mut desc.name, name);
        desc
    }

    /// The counter name.
    pub fn name(&self) -> String {
        read_cstr(&self.name)
    }
}

/// Byte size of [`Header`].
pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();

/// Byte size of [`Descriptor`].
pub const DESC_SIZE: usize = std::mem::size_of::<Descriptor>();

// The layout is a wire format: any drift in these sizes breaks every
// monitor already deployed.
const _: () = assert!(HEADER_SIZE == PATH_LEN + STAMP_LEN + NAME_LEN + 6 * 4);
const _: () = assert!(HEADER_SIZE == 536);
const _: () = assert!(DESC_SIZE == NAME_LEN);
const _: () = assert!(std::mem::align_of::<Header>() == 4);

/// Region sizes and offsets for a segment with the given geometry.
///
/// The same arithmetic runs on both sides: the producer uses it to size the
/// file it creates, the monitor to cross-check a header it just read.
///
/// # Examples
///
/// ```
/// use statshm::layout::{SegmentLayout, HEADER_SIZE};
///
/// let layout = SegmentLayout::new(4, 2);
/// assert_eq!(layout.desc_bytes(), 4 * 128);
/// assert_eq!(layout.stats_bytes(), 4 * 2 * 8);
/// assert_eq!(layout.total_bytes(), HEADER_SIZE + 512 + 64);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Counters per counter set.
    pub counter_num: usize,
    /// Number of counter sets.
    pub stat_num: usize,
}

impl SegmentLayout {
    pub fn new(counter_num: usize, stat_num: usize) -> Self {
        Self {
            counter_num,
            stat_num,
        }
    }

    /// Byte offset of the descriptor region.
    pub fn desc_offset(&self) -> usize {
        HEADER_SIZE
    }

    /// Byte offset of the counter region.
    pub fn stats_offset(&self) -> usize {
        HEADER_SIZE + self.desc_bytes()
    }

    /// Byte size of the descriptor region.
    pub fn desc_bytes(&self) -> usize {
        self.counter_num * DESC_SIZE
    }

    /// Byte size of the counter region.
    pub fn stats_bytes(&self) -> usize {
        self.counter_num * self.stat_num * COUNTER_BYTES
    }

    /// Byte size of the whole segment.
    pub fn total_bytes(&self) -> usize {
        HEADER_SIZE + self.desc_bytes() + self.stats_bytes()
    }

    /// Total counter words in the segment.
    pub fn words(&self) -> usize {
        self.counter_num * self.stat_num
    }

    /// Word range of one counter set within the counter region.
    pub fn slot_words(&self, id: u32) -> Range<usize> {
        let start = id as usize * self.counter_num;
        start..start + self.counter_num
    }
}

impl Header {
    /// Builds the header written at segment creation.
    pub fn for_segment(path: &str, name: &str, created: &str, layout: SegmentLayout) -> Self {
        let mut header = Self::zeroed();
        write_cstr(&mut header.shm_path, path);
        write_cstr(&mut header.created, created);
        write_cstr(&mut header.name, name);
        header.counter_num = layout.counter_num as i32;
        header.stat_num = layout.stat_num as i32;
        header.header_size = HEADER_SIZE as i32;
        header.desc_size = layout.desc_bytes() as i32;
        header.stats_size = layout.stats_bytes() as i32;
        header.total_size = layout.total_bytes() as i32;
        header
    }

    /// Registry name embedded in the header.
    pub fn name(&self) -> String {
        read_cstr(&self.name)
    }

    /// Path the segment was created under.
    pub fn shm_path(&self) -> String {
        read_cstr(&self.shm_path)
    }

    /// Creation time stamp.
    pub fn created(&self) -> String {
        read_cstr(&self.created)
    }

    /// Cross-checks every header field against the file length and returns
    /// the geometry on success.
    ///
    /// A reader must not trust any size field in isolation: a truncated or
    /// half-written segment would otherwise send it reading past the
    /// mapping. Failures surface as [`Error::InvalidState`]; callers on the
    /// monitor side log and skip the segment.
    pub fn validate(&self, file_len: usize) -> Result<SegmentLayout> {
        if self.counter_num < 1 || self.stat_num < 1 {
            return Err(Error::InvalidState);
        }
        let layout = SegmentLayout::new(self.counter_num as usize, self.stat_num as usize);
        if self.header_size != HEADER_SIZE as i32
            || self.desc_size != layout.desc_bytes() as i32
            || self.stats_size != layout.stats_bytes() as i32
            || self.total_size != layout.total_bytes() as i32
            || layout.total_bytes() > file_len
        {
            return Err(Error::InvalidState);
        }
        Ok(layout)
    }
}

/// Copies `s` into `buf` NUL-terminated, truncating to `buf.len() - 1`.
pub(crate) fn write_cstr(buf: &mut [u8], s: &str) {
    let n = s.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
    for b in &mut buf[n..] {
        *b = 0;
    }
}

/// Reads a NUL-terminated buffer back into a `String`, lossily.
pub(crate) fn read_cstr(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Parsed fields of a segment file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    /// Producer-chosen numeric id.
    pub id: u32,
    /// Registry name.
    pub name: String,
    /// Producer process id.
    pub pid: u32,
    /// Opaque per-process instance token.
    pub instance: String,
}

/// Formats a segment file name: `.statshm.<id>.<name>.<pid>.<instance>`.
pub fn segment_file_name(id: u32, name: &str, pid: u32, instance: u64) -> String {
    format!("{SEGMENT_PREFIX}{id}.{name}.{pid}.{instance}")
}

/// Parses a segment file name, or `None` for any other directory entry.
///
/// The pid and instance token are taken from the right so a registry name
/// containing dots still parses.
///
/// # Examples
///
/// ```
/// use statshm::layout::parse_segment_name;
///
/// let seg = parse_segment_name(".statshm.0.unet_ib_stats.4242.1").unwrap();
/// assert_eq!(seg.name, "unet_ib_stats");
/// assert_eq!(seg.pid, 4242);
/// ```
pub fn parse_segment_name(file: &str) -> Option<SegmentName> {
    let rest = file.strip_prefix(SEGMENT_PREFIX)?;
    let (id, rest) = rest.split_once('.')?;
    let (rest, instance) = rest.rsplit_once('.')?;
    let (name, pid) = rest.rsplit_once('.')?;
    if name.is_empty() || instance.is_empty() {
        return None;
    }
    Some(SegmentName {
        id: id.parse().ok()?,
        name: name.to_string(),
        pid: pid.parse().ok()?,
        instance: instance.to_string(),
    })
}

/// Formats a lock file name: `.statshm_lock.<proc>.<pid>`.
pub fn lock_file_name(proc_name: &str, pid: u32) -> String {
    format!("{LOCK_PREFIX}{proc_name}.{pid}")
}

/// Parses a lock file name into `(process name, pid)`.
pub fn parse_lock_name(file: &str) -> Option<(String, u32)> {
    let rest = file.strip_prefix(LOCK_PREFIX)?;
    let (proc_name, pid) = rest.rsplit_once('.')?;
    if proc_name.is_empty() {
        return None;
    }
    Some((proc_name.to_string(), pid.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_536_bytes() {
        assert_eq!(std::mem::size_of::<Header>(), 536);
        assert_eq!(std::mem::size_of::<Descriptor>(), 128);
    }

    #[test]
    fn test_layout_math() {
        let layout = SegmentLayout::new(4, 2);
        assert_eq!(layout.desc_offset(), 536);
        assert_eq!(layout.stats_offset(), 536 + 512);
        assert_eq!(layout.total_bytes(), 536 + 512 + 64);
        assert_eq!(layout.words(), 8);
        assert_eq!(layout.slot_words(1), 4..8);
    }

    #[test]
    fn test_header_roundtrip_and_validate() {
        let layout = SegmentLayout::new(10, 1);
        let header = Header::for_segment("/dev/shm/.statshm.0.x.1.1", "x", "now", layout);
        assert_eq!(header.name(), "x");
        assert_eq!(header.created(), "now");
        assert_eq!(header.validate(layout.total_bytes()).unwrap(), layout);
        // A shorter file than the header claims must be rejected.
        assert!(header.validate(layout.total_bytes() - 1).is_err());
    }

    #[test]
    fn test_validate_rejects_zeroed_header() {
        let header = Header::zeroed();
        assert!(header.validate(4096).is_err());
    }

    #[test]
    fn test_validate_rejects_inconsistent_sizes() {
        let layout = SegmentLayout::new(3, 2);
        let mut header = Header::for_segment("p", "n", "t", layout);
        header.desc_size += 128;
        assert!(header.validate(1 << 20).is_err());
    }

    #[test]
    fn test_write_cstr_truncates() {
        let mut buf = [0xffu8; 8];
        write_cstr(&mut buf, "abcdefghij");
        assert_eq!(&buf, b"abcdefg\0");
        assert_eq!(read_cstr(&buf), "abcdefg");
    }

    #[test]
    fn test_segment_name_roundtrip() {
        let file = segment_file_name(3, "unet_bw_stats", 999, 7);
        assert_eq!(file, ".statshm.3.unet_bw_stats.999.7");
        let seg = parse_segment_name(&file).unwrap();
        assert_eq!(seg.id, 3);
        assert_eq!(seg.name, "unet_bw_stats");
        assert_eq!(seg.pid, 999);
        assert_eq!(seg.instance, "7");
    }

    #[test]
    fn test_segment_name_with_dots() {
        let seg = parse_segment_name(".statshm.0.a.b.c.42.9").unwrap();
        assert_eq!(seg.name, "a.b.c");
        assert_eq!(seg.pid, 42);
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert!(parse_segment_name("core.1234").is_none());
        assert!(parse_segment_name(".statshm.notanid.x.1.1").is_none());
        assert!(parse_segment_name(".statshm.1.x.notapid.1").is_none());
        assert!(parse_lock_name(".statshm.0.x.1.1").is_none());
    }

    #[test]
    fn test_lock_name_roundtrip() {
        let file = lock_file_name("my.server", 4242);
        assert_eq!(file, ".statshm_lock.my.server.4242");
        let (proc_name, pid) = parse_lock_name(&file).unwrap();
        assert_eq!(proc_name, "my.server");
        assert_eq!(pid, 4242);
    }
}
