//! Counter registries: the producer-side owner of one segment.
//!
//! A [`Registry`] describes a counter group up front (an id, a name, how
//! many counter sets, which counters per set), materializes it as one
//! shared-memory segment on [`init`](Registry::init), and then hands out
//! [`CounterSet`] slots from a bounded free list. The segment never grows
//! or moves after `init`; capacity is a construction-time decision.
//!
//! Lifecycle is `Created` → `Initialized` → `Error`, one way. `init` is
//! idempotent: the second and later calls on an initialized registry are
//! successful no-ops, so independent components of one process can all
//! "make sure" the group exists without coordinating.
//!
//! Dropping the registry zeroes the whole segment and unlinks its file.
//! Counter sets still alive at that point keep the mapping itself alive
//! (their updates simply land in a zeroed, unlinked segment), and an
//! attached monitor keeps reading until its own scan notices the file is
//! gone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::counterset::CounterSet;
use crate::error::{Error, Result};
use crate::layout::{segment_file_name, Descriptor, Header, SegmentLayout, SHM_ROOT};
use crate::shm::SegmentMap;

/// Distinguishes multiple registries with the same id, name and pid.
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Initialized,
    Error,
}

struct Inner {
    state: State,
    map: Option<Arc<SegmentMap>>,
    free: VecDeque<u32>,
    live: HashSet<u32>,
}

/// Owner of one counter segment.
///
/// # Examples
///
/// ```no_run
/// use statshm::Registry;
///
/// let registry = Registry::new(0, "unet_ib_stats", 1, ["pid", "tx_bytes"]);
/// registry.init()?;
///
/// let counters = registry.alloc()?;
/// counters.add("tx_bytes", 4096)?;
/// registry.free(counters)?;
/// # Ok::<(), statshm::Error>(())
/// ```
pub struct Registry {
    id: u32,
    name: String,
    root: PathBuf,
    layout: SegmentLayout,
    counters: Vec<String>,
    names: Arc<HashMap<String, usize>>,
    inner: Mutex<Inner>,
}

impl Registry {
    /// Describes a counter group without touching the filesystem yet.
    ///
    /// `stat_num` fixes how many counter sets the segment will hold and
    /// `counters` names the counters of every set, in index order. With a
    /// duplicated name, lookups resolve to its first occurrence.
    pub fn new(
        id: u32,
        name: impl Into<String>,
        stat_num: usize,
        counters: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let counters: Vec<String> = counters.into_iter().map(Into::into).collect();
        let mut names = HashMap::with_capacity(counters.len());
        for (index, counter) in counters.iter().enumerate() {
            names.entry(counter.clone()).or_insert(index);
        }
        let layout = SegmentLayout::new(counters.len(), stat_num);
        Self {
            id,
            name: name.into(),
            root: PathBuf::from(SHM_ROOT),
            layout,
            counters,
            names: Arc::new(names),
            inner: Mutex::new(Inner {
                state: State::Created,
                map: None,
                free: (0..stat_num as u32).collect(),
                live: HashSet::new(),
            }),
        }
    }

    /// Overrides the directory the segment is created in.
    ///
    /// The default is `/dev/shm`; tests point this at a scratch directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Creates, sizes, zero-fills and describes the segment.
    ///
    /// Idempotent: returns `Ok(())` without side effects if the registry is
    /// already initialized. Any failure parks the registry in its terminal
    /// error state; later calls fail with [`Error::InvalidState`].
    pub fn init(&self) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.state {
            State::Initialized => return Ok(()),
            State::Error => return Err(Error::InvalidState),
            State::Created => {}
        }

        if self.layout.counter_num == 0 || self.layout.stat_num == 0 {
            inner.state = State::Error;
            return Err(Error::InvalidState);
        }

        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let file = segment_file_name(self.id, &self.name, std::process::id(), instance);
        let path = self.root.join(file);

        let map = match SegmentMap::create(&path, self.layout) {
            Ok(map) => map,
            Err(err) => {
                warn!(name = %self.name, path = %path.display(), %err, "failed to create segment");
                inner.state = State::Error;
                return Err(err);
            }
        };

        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let header = Header::for_segment(&path.to_string_lossy(), &self.name, &stamp, self.layout);
        map.write_header(&header);

        let descs: Vec<Descriptor> = self
            .counters
            .iter()
            .map(|name| Descriptor::for_name(name))
            .collect();
        map.write_descriptors(&self.layout, &descs);

        if let Err(err) = map.words(&self.layout) {
            warn!(name = %self.name, %err, "counter region unusable");
            inner.state = State::Error;
            return Err(err);
        }

        info!(name = %self.name, path = %path.display(), "stats segment initialized");
        inner.map = Some(Arc::new(map));
        inner.state = State::Initialized;
        Ok(())
    }

    /// Takes the next free counter set, zeroed.
    ///
    /// Fails with [`Error::Exhausted`] once all `stat_num` sets are out;
    /// freeing a set puts its slot back at the end of the queue.
    pub fn alloc(&self) -> Result<CounterSet> {
        let mut inner = self.lock()?;
        match inner.state {
            State::Initialized => {}
            State::Created => return Err(Error::NotInitialized),
            State::Error => return Err(Error::InvalidState),
        }

        let Some(id) = inner.free.pop_front() else {
            warn!(name = %self.name, "counter sets exhausted");
            return Err(Error::Exhausted);
        };
        let map = inner.map.as_ref().cloned().ok_or(Error::InvalidState)?;
        let words = map.words(&self.layout)?;
        let base = words[self.layout.slot_words(id)].as_ptr();

        let set = CounterSet::new(
            id,
            base,
            self.layout.counter_num,
            Arc::clone(&self.names),
            map,
        );
        set.clear();
        inner.live.insert(id);
        Ok(set)
    }

    /// Returns a counter set to the free list, zeroed.
    ///
    /// The set must have come from this registry; anything else fails with
    /// [`Error::UnknownHandle`].
    pub fn free(&self, set: CounterSet) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.state {
            State::Initialized => {}
            State::Created => return Err(Error::NotInitialized),
            State::Error => return Err(Error::InvalidState),
        }

        let ours = inner
            .map
            .as_ref()
            .is_some_and(|map| Arc::ptr_eq(map, &set.map));
        if !ours || !inner.live.remove(&set.id()) {
            return Err(Error::UnknownHandle(set.id()));
        }
        set.clear();
        inner.free.push_back(set.id());
        Ok(())
    }

    /// Registry name, as embedded in header and file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric id, the first component of the segment file name.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Segment geometry.
    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    /// Counter names in index order.
    pub fn counter_names(&self) -> &[String] {
        &self.counters
    }

    /// Directory the segment lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the segment file, once initialized.
    pub fn path(&self) -> Option<PathBuf> {
        self.lock()
            .ok()
            .and_then(|inner| inner.map.as_ref().map(|map| map.path().to_path_buf()))
    }

    /// Number of counter sets currently allocatable.
    pub fn available(&self) -> usize {
        self.lock().map(|inner| inner.free.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| Error::InvalidState)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.state = State::Error;
        inner.free.clear();
        inner.live.clear();
        if let Some(map) = inner.map.take() {
            map.zero();
            if let Err(err) = map.unlink() {
                debug!(name = %self.name, %err, "failed to unlink segment");
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::parse_segment_name;

    fn registry(dir: &Path) -> Registry {
        Registry::new(7, "unit", 2, ["alpha", "beta"]).with_root(dir)
    }

    #[test]
    fn test_accessors_reflect_construction() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        assert_eq!(registry.id(), 7);
        assert_eq!(registry.name(), "unit");
        assert_eq!(registry.root(), dir.path());
        assert_eq!(registry.counter_names(), ["alpha", "beta"]);
        assert_eq!(registry.layout(), SegmentLayout::new(2, 2));
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.init().unwrap();
        let path = registry.path().unwrap();
        registry.init().unwrap();
        assert_eq!(registry.path().unwrap(), path);
        assert!(path.exists());
    }

    #[test]
    fn test_segment_file_name_is_discoverable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.init().unwrap();

        let path = registry.path().unwrap();
        let seg = parse_segment_name(path.file_name().unwrap().to_str().unwrap()).unwrap();
        assert_eq!(seg.id, 7);
        assert_eq!(seg.name, "unit");
        assert_eq!(seg.pid, std::process::id());
    }

    #[test]
    fn test_alloc_before_init_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        assert!(matches!(registry.alloc(), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_empty_schema_cannot_init() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(0, "empty", 1, Vec::<String>::new()).with_root(dir.path());
        assert!(matches!(registry.init(), Err(Error::InvalidState)));
        // The failure is sticky.
        assert!(matches!(registry.init(), Err(Error::InvalidState)));
    }

    #[test]
    fn test_exhaustion_and_fifo_recycling() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.init().unwrap();

        let first = registry.alloc().unwrap();
        let second = registry.alloc().unwrap();
        assert_eq!((first.id(), second.id()), (0, 1));
        assert!(matches!(registry.alloc(), Err(Error::Exhausted)));

        // Prior handles stay valid across an exhausted alloc.
        second.inc("alpha").unwrap();
        assert_eq!(second.get("alpha").unwrap(), 1);

        registry.free(first).unwrap();
        let third = registry.alloc().unwrap();
        assert_eq!(third.id(), 0);
    }

    #[test]
    fn test_realloc_starts_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.init().unwrap();

        let set = registry.alloc().unwrap();
        set.add("alpha", 99).unwrap();
        registry.free(set).unwrap();

        let set = registry.alloc().unwrap();
        assert_eq!(set.get("alpha").unwrap(), 0);
    }

    #[test]
    fn test_free_rejects_foreign_set() {
        let dir = tempfile::tempdir().unwrap();
        let ours = registry(dir.path());
        ours.init().unwrap();
        let theirs = Registry::new(8, "other", 1, ["alpha"]).with_root(dir.path());
        theirs.init().unwrap();

        let stray = theirs.alloc().unwrap();
        assert!(matches!(ours.free(stray), Err(Error::UnknownHandle(0))));
    }

    #[test]
    fn test_drop_unlinks_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let registry = registry(dir.path());
            registry.init().unwrap();
            registry.path().unwrap()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_live_set_survives_registry_drop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.init().unwrap();
        let set = registry.alloc().unwrap();
        set.set("alpha", 5).unwrap();
        drop(registry);

        // The mapping is zeroed and unlinked, but still safely writable.
        assert_eq!(set.get("alpha").unwrap(), 0);
        set.inc("alpha").unwrap();
        assert_eq!(set.get("alpha").unwrap(), 1);
    }

    #[test]
    fn test_available_tracks_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.init().unwrap();
        assert_eq!(registry.available(), 2);
        let set = registry.alloc().unwrap();
        assert_eq!(registry.available(), 1);
        registry.free(set).unwrap();
        assert_eq!(registry.available(), 2);
    }
}
