//! Deletion marker index
//!
//! Keeps the set of marker file names found in the marker directory of the
//! writable branch, so deletion checks do not have to stat a marker file for
//! every lookup. A cold index never blocks: the check answers "unknown" and a
//! background task lists the marker directory. Once populated the set expires
//! after the TTL and a timer task sweeps it away.

use crate::branch::{Branch, FileKind};
use crate::cache::{Clock, TimedCache};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Answer of a marker lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryState {
    /// The index was warm, so `deleted` is authoritative
    pub known: bool,
    pub deleted: bool,
    /// This call launched a background refresh
    pub refresh_started: bool,
}

/// List the marker directory, keeping regular files only.
/// A missing directory means nothing has been deleted yet.
pub fn load_markers(branch: &dyn Branch, dir: &str) -> Result<HashSet<String>> {
    match branch.open_dir(dir) {
        Ok(entries) => Ok(entries
            .into_iter()
            .filter(|e| e.kind == FileKind::RegularFile)
            .map(|e| e.name)
            .collect()),
        Err(e) if e.is_not_found() => Ok(HashSet::new()),
        Err(e) => Err(e),
    }
}

struct Inner {
    branch: Arc<dyn Branch>,
    dir: String,
    cache: TimedCache<String, HashSet<String>>,
    refreshing: AtomicBool,
    /// Set while a sweep task is waiting to purge the expired set
    expiry_pending: AtomicBool,
    /// Bumped on every marker change and on drop.
    /// A listing taken before such a change must not be installed.
    generation: Mutex<u64>,
    runtime: Handle,
}

/// Index of deletion markers in one marker directory
#[derive(Clone)]
pub struct DeletionIndex {
    inner: Arc<Inner>,
}

impl DeletionIndex {
    pub fn new(
        branch: Arc<dyn Branch>,
        dir: impl Into<String>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                branch,
                dir: dir.into(),
                cache: TimedCache::with_clock(ttl, clock),
                refreshing: AtomicBool::new(false),
                expiry_pending: AtomicBool::new(false),
                generation: Mutex::new(0),
                runtime,
            }),
        }
    }

    pub fn dir(&self) -> &str {
        &self.inner.dir
    }

    pub fn is_warm(&self) -> bool {
        self.inner.cache.peek_with(&self.inner.dir, |_| ()).is_some()
    }

    /// Check whether a marker name is present
    pub fn has_entry(&self, name: &str) -> EntryState {
        match self
            .inner
            .cache
            .peek_with(&self.inner.dir, |names| names.contains(name))
        {
            Some(deleted) => EntryState {
                known: true,
                deleted,
                refresh_started: false,
            },
            None => EntryState {
                known: false,
                deleted: false,
                refresh_started: self.maybe_refresh(),
            },
        }
    }

    pub fn add_entry(&self, name: &str) {
        self.mutate(|names| {
            names.insert(name.to_string());
        });
    }

    pub fn remove_entry(&self, name: &str) {
        self.mutate(|names| {
            names.remove(name);
        });
    }

    fn mutate<F: FnOnce(&mut HashSet<String>)>(&self, f: F) {
        let applied = {
            let mut generation = self.inner.generation.lock();
            *generation += 1;
            self.inner.cache.update(&self.inner.dir, f)
        };
        if !applied {
            self.maybe_refresh();
        }
    }

    pub fn drop_cache(&self) {
        let mut generation = self.inner.generation.lock();
        *generation += 1;
        self.inner.cache.drop_all(None);
    }

    /// Token to pass to [`populate`](Self::populate) for a listing taken now
    pub fn generation(&self) -> u64 {
        *self.inner.generation.lock()
    }

    /// Install a listing of the marker directory taken at `generation`.
    /// Returns false (and leaves the index alone) if markers changed since.
    pub fn populate(&self, names: HashSet<String>, generation: u64) -> bool {
        Inner::populate(&self.inner, names, generation)
    }

    /// Start a background refresh unless one is already running
    fn maybe_refresh(&self) -> bool {
        if self.inner.refreshing.swap(true, Ordering::SeqCst) {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        let generation = self.generation();
        debug!("refreshing deletion index for {:?}", inner.dir);
        self.inner.runtime.spawn_blocking(move || {
            match load_markers(inner.branch.as_ref(), &inner.dir) {
                Ok(names) => {
                    Inner::populate(&inner, names, generation);
                }
                Err(e) => warn!("listing deletion markers in {:?}: {}", inner.dir, e),
            }
            inner.refreshing.store(false, Ordering::SeqCst);
        });
        true
    }
}

impl Inner {
    fn populate(inner: &Arc<Inner>, names: HashSet<String>, generation: u64) -> bool {
        {
            let current = inner.generation.lock();
            if *current != generation {
                debug!("discarding stale deletion listing for {:?}", inner.dir);
                return false;
            }
            inner.cache.set(inner.dir.clone(), names);
        }
        Inner::arm_expiry(inner);
        true
    }

    /// Spawn the sweep task unless one is already waiting.
    /// The task keeps sweeping while the set stays warm.
    fn arm_expiry(inner: &Arc<Inner>) -> bool {
        let ttl = inner.cache.ttl();
        if ttl.is_zero() || inner.expiry_pending.swap(true, Ordering::SeqCst) {
            return false;
        }

        let expiring = Arc::clone(inner);
        inner.runtime.spawn(async move {
            loop {
                tokio::time::sleep(ttl).await;
                expiring.cache.purge();
                expiring.expiry_pending.store(false, Ordering::SeqCst);
                let warm = !expiring.cache.is_empty();
                if !warm || expiring.expiry_pending.swap(true, Ordering::SeqCst) {
                    break;
                }
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::LocalBranch;
    use crate::cache::{ManualClock, MonotonicClock};
    use std::fs;
    use tempfile::tempdir;

    fn wait_until_warm(index: &DeletionIndex) {
        for _ in 0..200 {
            if index.is_warm() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("deletion index never warmed up");
    }

    fn setup(
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> (tempfile::TempDir, tokio::runtime::Runtime, DeletionIndex) {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("DELETIONS")).unwrap();
        fs::write(dir.path().join("DELETIONS/abc-x"), b"x").unwrap();
        fs::create_dir(dir.path().join("DELETIONS/not-a-marker")).unwrap();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let branch = Arc::new(LocalBranch::new(dir.path().to_path_buf()).unwrap());
        let index = DeletionIndex::new(branch, "DELETIONS", ttl, clock, runtime.handle().clone());
        (dir, runtime, index)
    }

    #[test]
    fn test_cold_lookup_refreshes_in_background() {
        let (_dir, _rt, index) = setup(Duration::from_secs(60), Arc::new(MonotonicClock));

        let first = index.has_entry("abc-x");
        assert!(!first.known);
        assert!(!first.deleted);
        assert!(first.refresh_started);

        wait_until_warm(&index);
        let state = index.has_entry("abc-x");
        assert!(state.known && state.deleted);
        assert!(!index.has_entry("not-a-marker").deleted);
    }

    #[test]
    fn test_add_and_remove_on_warm_index() {
        let (_dir, _rt, index) = setup(Duration::from_secs(60), Arc::new(MonotonicClock));
        index.has_entry("abc-x");
        wait_until_warm(&index);

        index.add_entry("def-y");
        assert!(index.has_entry("def-y").deleted);
        index.remove_entry("abc-x");
        assert!(!index.has_entry("abc-x").deleted);
        assert!(index.has_entry("abc-x").known);
    }

    #[test]
    fn test_drop_cache_makes_index_cold() {
        let (_dir, _rt, index) = setup(Duration::from_secs(60), Arc::new(MonotonicClock));
        index.has_entry("abc-x");
        wait_until_warm(&index);

        index.drop_cache();
        assert!(!index.has_entry("abc-x").known);
        wait_until_warm(&index);
    }

    #[test]
    fn test_entries_expire_with_ttl() {
        let clock = Arc::new(ManualClock::new());
        let (_dir, _rt, index) = setup(Duration::from_secs(5), clock.clone());
        index.has_entry("abc-x");
        wait_until_warm(&index);

        clock.advance(Duration::from_secs(5));
        assert!(!index.is_warm());
    }

    #[test]
    fn test_stale_listing_is_discarded() {
        let (_dir, _rt, index) = setup(Duration::from_secs(60), Arc::new(MonotonicClock));
        let generation = index.generation();

        // A marker change on a cold index invalidates listings taken before it.
        index.inner.refreshing.store(true, Ordering::SeqCst);
        index.add_entry("new-z");
        assert!(!index.populate(HashSet::new(), generation));
        assert!(!index.is_warm());

        assert!(index.populate(HashSet::from(["new-z".to_string()]), index.generation()));
        assert!(index.has_entry("new-z").deleted);
    }

    #[test]
    fn test_listing_taken_before_warm_change_is_discarded() {
        let (_dir, _rt, index) = setup(Duration::from_secs(60), Arc::new(MonotonicClock));
        index.has_entry("abc-x");
        wait_until_warm(&index);

        let generation = index.generation();
        let listing = HashSet::from(["abc-x".to_string()]);
        index.add_entry("new-z");
        index.remove_entry("abc-x");

        assert!(!index.populate(listing, generation));
        assert!(index.has_entry("new-z").deleted);
        assert!(!index.has_entry("abc-x").deleted);
    }

    #[test]
    fn test_one_sweep_task_per_index() {
        let (_dir, _rt, index) = setup(Duration::from_secs(60), Arc::new(MonotonicClock));
        assert!(index.populate(HashSet::new(), index.generation()));
        assert!(index.inner.expiry_pending.load(Ordering::SeqCst));

        assert!(index.populate(HashSet::new(), index.generation()));
        assert!(!Inner::arm_expiry(&index.inner));
    }

    #[test]
    fn test_no_sweep_without_ttl() {
        let (_dir, _rt, index) = setup(Duration::ZERO, Arc::new(MonotonicClock));
        assert!(index.populate(HashSet::new(), index.generation()));
        assert!(!index.inner.expiry_pending.load(Ordering::SeqCst));
    }

    #[test]
    fn test_missing_marker_dir_is_empty() {
        let dir = tempdir().unwrap();
        let branch = LocalBranch::new(dir.path().to_path_buf()).unwrap();
        assert!(load_markers(&branch, "nothing-here").unwrap().is_empty());
    }
}
