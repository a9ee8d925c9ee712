//! Counter sets: the producer-side handle to one slot of a segment.
//!
//! A [`CounterSet`] is what a worker actually updates. It addresses one
//! fixed-size row of counters inside a mapped segment, either by the name
//! the registry was built with or by plain index for hot paths that cannot
//! afford a hash lookup.
//!
//! The set keeps its segment mapped (shared ownership), so updates stay
//! valid even after the registry that issued the set unlinks the segment
//! file. The name lookup table is a per-process cache; the names that other
//! processes see live in the segment's descriptor region.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::shm::SegmentMap;

mod sealed {
    pub trait Sealed {}
    impl Sealed for usize {}
    impl Sealed for &str {}
}

/// Ways to address a counter within a [`CounterSet`].
///
/// Implemented for `&str` (resolved through the registry's name table) and
/// `usize` (bounds-checked index). Sealed: the two address modes are part
/// of the segment contract, not an extension point.
pub trait CounterKey: sealed::Sealed {
    /// Resolves to a counter index within the set.
    fn resolve(&self, set: &CounterSet) -> Result<usize>;
}

impl CounterKey for &str {
    fn resolve(&self, set: &CounterSet) -> Result<usize> {
        set.names
            .get(*self)
            .copied()
            .ok_or_else(|| Error::UnknownCounter((*self).to_string()))
    }
}

impl CounterKey for usize {
    fn resolve(&self, set: &CounterSet) -> Result<usize> {
        if *self < set.len {
            Ok(*self)
        } else {
            Err(Error::UnknownCounter(format!("#{self}")))
        }
    }
}

/// One allocated row of counters, updated with sequentially consistent
/// atomics from any thread.
///
/// # Examples
///
/// ```no_run
/// use statshm::Registry;
///
/// let registry = Registry::new(0, "demo", 1, ["requests", "errors"]);
/// registry.init()?;
///
/// let counters = registry.alloc()?;
/// counters.inc("requests")?;
/// counters.add("requests", 41)?;
/// assert_eq!(counters.get("requests")?, 42);
///
/// // Index addressing skips the name lookup on hot paths.
/// counters.inc(1usize)?;
/// # Ok::<(), statshm::Error>(())
/// ```
pub struct CounterSet {
    id: u32,
    base: *const AtomicUsize,
    len: usize,
    names: Arc<HashMap<String, usize>>,
    /// Keeps the segment mapped for as long as this set exists.
    pub(crate) map: Arc<SegmentMap>,
}

// SAFETY: `base` points into the mapping owned by `map`, which this struct
// keeps alive, and every word is only ever accessed atomically.
unsafe impl Send for CounterSet {}
unsafe impl Sync for CounterSet {}

impl CounterSet {
    pub(crate) fn new(
        id: u32,
        base: *const AtomicUsize,
        len: usize,
        names: Arc<HashMap<String, usize>>,
        map: Arc<SegmentMap>,
    ) -> Self {
        Self {
            id,
            base,
            len,
            names,
            map,
        }
    }

    fn words(&self) -> &[AtomicUsize] {
        // SAFETY: base/len were carved out of the mapping at allocation and
        // `self.map` keeps that mapping alive.
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    fn word(&self, key: impl CounterKey) -> Result<&AtomicUsize> {
        let index = key.resolve(self)?;
        Ok(&self.words()[index])
    }

    /// Slot id within the owning registry.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of counters in the set.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the set has no counters.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of a named counter, for callers that resolve once and then
    /// use index addressing.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    /// Adds `val` to a counter.
    pub fn add(&self, key: impl CounterKey, val: usize) -> Result<()> {
        self.word(key)?.fetch_add(val, Ordering::SeqCst);
        Ok(())
    }

    /// Subtracts `val` from a counter, wrapping on underflow.
    pub fn sub(&self, key: impl CounterKey, val: usize) -> Result<()> {
        self.word(key)?.fetch_sub(val, Ordering::SeqCst);
        Ok(())
    }

    /// Increments a counter by one.
    pub fn inc(&self, key: impl CounterKey) -> Result<()> {
        self.add(key, 1)
    }

    /// Decrements a counter by one, wrapping on underflow.
    pub fn dec(&self, key: impl CounterKey) -> Result<()> {
        self.sub(key, 1)
    }

    /// Reads a counter.
    pub fn get(&self, key: impl CounterKey) -> Result<usize> {
        Ok(self.word(key)?.load(Ordering::SeqCst))
    }

    /// Overwrites a counter.
    pub fn set(&self, key: impl CounterKey, val: usize) -> Result<()> {
        self.word(key)?.store(val, Ordering::SeqCst);
        Ok(())
    }

    /// Zeroes every counter in the set.
    pub fn clear(&self) {
        for word in self.words() {
            word.store(0, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for CounterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterSet")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Error, Registry};

    fn registry(dir: &std::path::Path) -> Registry {
        let registry = Registry::new(0, "unit", 2, ["alpha", "beta", "gamma"]).with_root(dir);
        registry.init().unwrap();
        registry
    }

    #[test]
    fn test_ops_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let counters = registry.alloc().unwrap();

        counters.inc("alpha").unwrap();
        counters.add("alpha", 9).unwrap();
        counters.sub("alpha", 4).unwrap();
        counters.dec("alpha").unwrap();
        assert_eq!(counters.get("alpha").unwrap(), 5);

        counters.set("beta", 77).unwrap();
        assert_eq!(counters.get("beta").unwrap(), 77);
        assert_eq!(counters.get("gamma").unwrap(), 0);
    }

    #[test]
    fn test_ops_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let counters = registry.alloc().unwrap();

        assert_eq!(counters.index_of("gamma"), Some(2));
        counters.add(2usize, 3).unwrap();
        assert_eq!(counters.get("gamma").unwrap(), 3);
        assert_eq!(counters.get(2usize).unwrap(), 3);
    }

    #[test]
    fn test_unknown_counter_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let counters = registry.alloc().unwrap();

        assert!(matches!(
            counters.inc("delta"),
            Err(Error::UnknownCounter(name)) if name == "delta"
        ));
        assert!(matches!(
            counters.get(3usize),
            Err(Error::UnknownCounter(_))
        ));
    }

    #[test]
    fn test_clear_zeroes_all() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let counters = registry.alloc().unwrap();

        counters.set("alpha", 1).unwrap();
        counters.set("beta", 2).unwrap();
        counters.set("gamma", 3).unwrap();
        counters.clear();
        for i in 0..counters.len() {
            assert_eq!(counters.get(i).unwrap(), 0);
        }
    }

    #[test]
    fn test_concurrent_increments_do_not_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let counters = registry.alloc().unwrap();

        const THREADS: usize = 64;
        const PER_THREAD: usize = 10_000;
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..PER_THREAD {
                        counters.inc("alpha").unwrap();
                    }
                });
            }
        });
        assert_eq!(counters.get("alpha").unwrap(), THREADS * PER_THREAD);
    }

    #[test]
    fn test_slots_do_not_alias() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let first = registry.alloc().unwrap();
        let second = registry.alloc().unwrap();

        first.set("alpha", 11).unwrap();
        second.set("alpha", 22).unwrap();
        assert_eq!(first.get("alpha").unwrap(), 11);
        assert_eq!(second.get("alpha").unwrap(), 22);
    }
}
