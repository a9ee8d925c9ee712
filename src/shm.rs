//! File-backed shared-memory mappings.
//!
//! [`SegmentMap`] wraps one `mmap(MAP_SHARED)` of a segment file. Producers
//! create it read-write and zero-fill it; monitors attach the same file
//! read-only. Dropping a map only unmaps; removing the file is a separate,
//! explicit step ([`SegmentMap::unlink`]) taken by the owning producer and
//! never by a reader. An unlinked segment stays fully readable through every
//! existing mapping, which is what lets an attached monitor outlive the
//! producer it is watching.

use std::fs::{File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;

use crate::error::{Error, Result};
use crate::layout::{Descriptor, Header, SegmentLayout, COUNTER_ALIGN, HEADER_SIZE};

/// One mapped counter segment.
pub struct SegmentMap {
    ptr: *mut u8,
    len: usize,
    /// Kept open for the lifetime of the mapping.
    _file: File,
    path: PathBuf,
    writable: bool,
}

// SAFETY: the mapping is valid until drop, the mutable regions are only
// accessed through atomics, and the header/descriptor regions are written
// once before any reader can observe them.
unsafe impl Send for SegmentMap {}
unsafe impl Sync for SegmentMap {}

impl SegmentMap {
    /// Creates (or reuses) the segment file and maps it read-write.
    ///
    /// The file is made world-readable so an unprivileged monitor can
    /// attach. An existing file is never shrunk, only grown to the layout's
    /// size; the mapped range is zero-filled either way, so a reused name
    /// always starts from a clean slate.
    pub fn create(path: &Path, layout: SegmentLayout) -> Result<Self> {
        let total = layout.total_bytes();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)
            .map_err(Error::Allocation)?;
        // mode() above is filtered through the umask; chmod is not.
        file.set_permissions(Permissions::from_mode(0o666))
            .map_err(Error::Allocation)?;
        let file_len = file.metadata().map_err(Error::Allocation)?.len() as usize;
        if file_len < total {
            file.set_len(total as u64).map_err(Error::Allocation)?;
        }
        let ptr = Self::map(&file, total, libc::PROT_READ | libc::PROT_WRITE)?;
        let map = Self {
            ptr,
            len: total,
            _file: file,
            path: path.to_path_buf(),
            writable: true,
        };
        map.zero();
        Ok(map)
    }

    /// Maps an existing segment file read-only.
    ///
    /// The mapping covers the whole file; header validation against the
    /// mapped length is the caller's next step.
    pub fn attach(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(Error::InvalidState);
        }
        let ptr = Self::map(&file, len, libc::PROT_READ)?;
        Ok(Self {
            ptr,
            len,
            _file: file,
            path: path.to_path_buf(),
            writable: false,
        })
    }

    fn map(file: &File, len: usize, prot: libc::c_int) -> Result<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Allocation(io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty (never the case once created).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The segment header at offset 0.
    pub fn header(&self) -> &Header {
        // SAFETY: create/attach guarantee len >= HEADER_SIZE and mmap
        // returns page-aligned memory.
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr, HEADER_SIZE) };
        bytemuck::from_bytes(bytes)
    }

    /// The descriptor table, one entry per counter.
    pub fn descriptors(&self, layout: &SegmentLayout) -> &[Descriptor] {
        debug_assert!(layout.total_bytes() <= self.len);
        // SAFETY: range checked against the mapping; descriptors are
        // byte-aligned plain data.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.ptr.add(layout.desc_offset()), layout.desc_bytes())
        };
        bytemuck::cast_slice(bytes)
    }

    /// The counter region as one flat atomic word array.
    ///
    /// Fails with [`Error::Alignment`] if the region is not word-aligned
    /// and [`Error::InvalidState`] if the layout overruns the mapping.
    pub fn words(&self, layout: &SegmentLayout) -> Result<&[AtomicUsize]> {
        if layout.total_bytes() > self.len {
            return Err(Error::InvalidState);
        }
        let offset = layout.stats_offset();
        if (self.ptr as usize + offset) % COUNTER_ALIGN != 0 {
            return Err(Error::Alignment(COUNTER_ALIGN));
        }
        // SAFETY: range and alignment checked above; the words are shared
        // across processes and accessed only through atomic operations.
        Ok(unsafe {
            std::slice::from_raw_parts(self.ptr.add(offset) as *const AtomicUsize, layout.words())
        })
    }

    /// Writes the header region. Producer-side, before readers attach.
    pub(crate) fn write_header(&self, header: &Header) {
        debug_assert!(self.writable);
        let src = bytemuck::bytes_of(header);
        // SAFETY: len >= HEADER_SIZE on a created mapping.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr, src.len()) }
    }

    /// Writes the descriptor table. Producer-side, before readers attach.
    pub(crate) fn write_descriptors(&self, layout: &SegmentLayout, descs: &[Descriptor]) {
        debug_assert!(self.writable);
        debug_assert_eq!(descs.len(), layout.counter_num);
        let src: &[u8] = bytemuck::cast_slice(descs);
        // SAFETY: the descriptor region lies inside the created mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(layout.desc_offset()), src.len())
        }
    }

    /// Zero-fills the whole mapping.
    pub(crate) fn zero(&self) {
        debug_assert!(self.writable);
        // SAFETY: the full range belongs to this mapping.
        unsafe { std::ptr::write_bytes(self.ptr, 0, self.len) }
    }

    /// Removes the backing file. Existing mappings stay valid.
    pub(crate) fn unlink(&self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

impl Drop for SegmentMap {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Header;
    use std::sync::atomic::Ordering;

    fn small_layout() -> SegmentLayout {
        SegmentLayout::new(4, 2)
    }

    #[test]
    fn test_create_then_attach_sees_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".statshm.0.demo.1.1");
        let layout = small_layout();

        let map = SegmentMap::create(&path, layout).unwrap();
        let header = Header::for_segment(path.to_str().unwrap(), "demo", "now", layout);
        map.write_header(&header);

        let ro = SegmentMap::attach(&path).unwrap();
        assert_eq!(ro.header().name(), "demo");
        assert_eq!(ro.header().validate(ro.len()).unwrap(), layout);
    }

    #[test]
    fn test_create_zeroes_and_does_not_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, vec![0xAB; 1 << 16]).unwrap();

        let map = SegmentMap::create(&path, small_layout()).unwrap();
        let words = map.words(&small_layout()).unwrap();
        assert!(words.iter().all(|w| w.load(Ordering::SeqCst) == 0));
        // The larger pre-existing file keeps its size.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1 << 16);
    }

    #[test]
    fn test_counters_visible_across_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let layout = small_layout();

        let rw = SegmentMap::create(&path, layout).unwrap();
        rw.words(&layout).unwrap()[5].store(7, Ordering::SeqCst);

        let ro = SegmentMap::attach(&path).unwrap();
        assert_eq!(ro.words(&layout).unwrap()[5].load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_attach_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, b"too small").unwrap();
        assert!(SegmentMap::attach(&path).is_err());
    }

    #[test]
    fn test_unlink_keeps_mapping_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let layout = small_layout();

        let rw = SegmentMap::create(&path, layout).unwrap();
        let ro = SegmentMap::attach(&path).unwrap();
        rw.words(&layout).unwrap()[0].store(41, Ordering::SeqCst);
        rw.unlink().unwrap();
        assert!(!path.exists());

        rw.words(&layout).unwrap()[0].store(42, Ordering::SeqCst);
        assert_eq!(ro.words(&layout).unwrap()[0].load(Ordering::SeqCst), 42);
    }
}
