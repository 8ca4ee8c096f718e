//! The union filesystem
//!
//! Presents a prioritized list of branches as one tree. Branch 0 is
//! writable; everything else is read-only. Reads go to the highest-priority
//! branch holding a path, writes first copy the path up into branch 0, and
//! removals of read-only entries are recorded as deletion markers.
//!
//! All paths are relative, without leading or trailing `/`; the root is `""`.
//! Operations block the calling thread and must not be called from inside the
//! runtime the filesystem was built with.

use crate::branch::{Attr, Branch, DirEntry, FileKind, StatFs, DROP_CACHE_NAME};
use crate::cache::{load_markers, Clock, DeletionIndex};
use crate::config::Config;
use crate::error::{Error, Result};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::handle::{opens_for_write, HandleTable, NullFile};
use super::marker::{marker_name, Markers};
use super::path;
use super::resolver::{BranchResolver, BranchResult};

/// Union of branches, shared between the FUSE adapter and background tasks
pub struct UnionFs {
    pub(super) resolver: BranchResolver,
    pub(super) markers: Markers,
    pub(super) handles: HandleTable,
    runtime: Handle,
}

impl UnionFs {
    /// Build the union over `branches` (priority order, writable first)
    pub fn new(
        branches: Vec<Arc<dyn Branch>>,
        config: &Config,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Result<Arc<Self>> {
        let writable = branches
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidConfig("At least one branch is required".to_string()))?;

        let index = DeletionIndex::new(
            Arc::clone(&writable),
            config.deletion_dir.clone(),
            config.cache.deletion_ttl(),
            Arc::clone(&clock),
            runtime.clone(),
        );
        let markers = Markers::new(writable, index);
        markers.ensure_dir().map_err(|e| {
            Error::Internal(format!(
                "could not create deletion directory {:?}: {}",
                config.deletion_dir, e
            ))
        })?;

        let fs = Arc::new(Self {
            resolver: BranchResolver::new(branches, config.cache.branch_ttl(), clock),
            markers,
            handles: HandleTable::new(),
            runtime,
        });

        let interval = config.cache.purge_interval();
        if !interval.is_zero() {
            Self::spawn_purge_task(Arc::downgrade(&fs), &fs.runtime, interval);
        }

        info!("union over {}", fs);
        Ok(fs)
    }

    fn spawn_purge_task(fs: Weak<Self>, runtime: &Handle, interval: Duration) {
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(union) = fs.upgrade() else { break };
                let purged = union.resolver.purge();
                if purged > 0 {
                    debug!("purged {} expired branch resolutions", purged);
                }
            }
        });
    }

    pub fn branches(&self) -> &[Arc<dyn Branch>] {
        self.resolver.branches()
    }

    pub(super) fn writable(&self) -> &Arc<dyn Branch> {
        &self.resolver.branches()[0]
    }

    /// Which branch owns `path` right now, as seen through the union
    ///
    /// A lower-branch entry hidden by a deletion marker resolves as not found.
    pub fn resolve(&self, path: &str) -> BranchResult {
        self.resolve_visible(path).unwrap_or_else(|e| {
            warn!("deletion check for {:?} failed: {}", path, e);
            self.resolver.resolve(path)
        })
    }

    /// Resolve `path`, treating a lower entry with a deletion marker as absent
    pub(super) fn resolve_visible(&self, path: &str) -> Result<BranchResult> {
        let result = self.resolver.resolve(path);
        if result.is_lower() && self.markers.is_deleted(path)? {
            return Ok(BranchResult::not_found());
        }
        Ok(result)
    }

    pub fn is_deleted(&self, path: &str) -> Result<bool> {
        self.markers.is_deleted(path)
    }

    pub fn deletion_index(&self) -> &DeletionIndex {
        self.markers.index()
    }

    /// Forget cached resolutions, deletions and branch lookups
    pub fn drop_caches(&self) {
        info!("forced cache drop on {}", self);
        self.resolver.drop_all(None);
        self.markers.index().drop_cache();
        for branch in self.branches() {
            branch.drop_cache();
        }
    }

    /// Cache what branch 0 now holds at `path`, or a synthesized entry
    fn cache_upper(&self, path: &str, kind: FileKind, mode: u32) -> Attr {
        let attr = self
            .writable()
            .get_attr(path)
            .unwrap_or_else(|_| Attr::new(kind, (mode & 0o7777) as u16));
        self.resolver.set(path, BranchResult::found(0, attr.clone()));
        attr
    }

    // Reads

    pub fn get_attr(&self, path: &str) -> Result<Attr> {
        if path == DROP_CACHE_NAME {
            return Ok(Attr::new(FileKind::RegularFile, 0o777));
        }
        if path == self.markers.dir() {
            return Err(Error::NotFound);
        }

        let mut attr = self.resolve_visible(path)?.status()?.clone();
        attr.perm |= 0o200;
        Ok(attr)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let branch = self.resolve_visible(path)?.branch().ok_or(Error::NotFound)?;
        self.branches()[branch].readlink(path)
    }

    /// Permission check; write access is always granted
    pub fn access(&self, path: &str, mask: i32) -> Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        let mask = mask & !libc::W_OK;
        let branch = self.resolve_visible(path)?.branch().ok_or(Error::NotFound)?;
        self.branches()[branch].access(path, mask)
    }

    pub fn get_xattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        if path == DROP_CACHE_NAME {
            return Err(Error::NoData);
        }
        let branch = self.resolve_visible(path)?.branch().ok_or(Error::NotFound)?;
        self.branches()[branch].get_xattr(path, name)
    }

    pub fn list_xattr(&self, path: &str) -> Result<Vec<String>> {
        if path == DROP_CACHE_NAME {
            return Ok(Vec::new());
        }
        let branch = self.resolve_visible(path)?.branch().ok_or(Error::NotFound)?;
        self.branches()[branch].list_xattr(path)
    }

    pub fn statfs(&self) -> Result<StatFs> {
        self.writable().statfs("")
    }

    /// Merged listing of a directory
    ///
    /// Entries of higher-priority branches shadow same-named entries below;
    /// entries of read-only branches are dropped when a deletion marker
    /// exists for them. The order of the result is unspecified.
    pub fn list_dir(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let resolved = self.resolve_visible(dir)?;
        let first = resolved.branch().ok_or(Error::NotFound)?;
        if !resolved.is_dir() {
            return Err(Error::NotADirectory);
        }

        let generation = self.markers.index().generation();
        let marker_task = {
            let writable = Arc::clone(self.writable());
            let marker_dir = self.markers.dir().to_string();
            self.runtime
                .spawn_blocking(move || load_markers(writable.as_ref(), &marker_dir))
        };
        let listing_tasks: Vec<_> = self.branches()[first..]
            .iter()
            .map(|branch| {
                let branch = Arc::clone(branch);
                let dir = dir.to_string();
                self.runtime.spawn_blocking(move || branch.open_dir(&dir))
            })
            .collect();

        let (markers, listings) = self
            .runtime
            .block_on(async { futures::join!(marker_task, join_all(listing_tasks)) });

        let deleted = match markers {
            Ok(Ok(names)) => names,
            Ok(Err(e)) => {
                error!("listing deletion markers: {}", e);
                return Err(Error::ReadOnlyFilesystem);
            }
            Err(e) => {
                error!("deletion marker task failed: {}", e);
                return Err(Error::ReadOnlyFilesystem);
            }
        };

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for (offset, listing) in listings.into_iter().enumerate() {
            let index = first + offset;
            let entries = match listing {
                Ok(Ok(entries)) => entries,
                Ok(Err(e)) => {
                    if !matches!(e, Error::NotFound | Error::NotADirectory) {
                        warn!("listing {:?} in branch {}: {}", dir, index, e);
                    }
                    continue;
                }
                Err(e) => {
                    warn!("listing task for branch {} failed: {}", index, e);
                    continue;
                }
            };

            for entry in entries {
                if seen.contains(&entry.name) {
                    continue;
                }
                if dir.is_empty() && entry.name == self.markers.dir() {
                    continue;
                }
                if index > 0 && deleted.contains(&marker_name(&path::join(dir, &entry.name))) {
                    continue;
                }
                seen.insert(entry.name.clone());
                merged.push(entry);
            }
        }

        self.markers.index().populate(deleted, generation);
        Ok(merged)
    }

    // Open files

    /// Open an existing file, promoting it first when opened for writing
    pub fn open(&self, path: &str, flags: i32) -> Result<u64> {
        if path == DROP_CACHE_NAME {
            if opens_for_write(flags) {
                self.drop_caches();
            }
            return Ok(self.handles.insert(path, flags, 0, Box::new(NullFile)));
        }

        let mut result = self.resolve_visible(path)?;
        let mut branch = match result.branch() {
            Some(branch) => branch,
            None => {
                debug!("open of non-existent file {:?}", path);
                return Err(Error::NotFound);
            }
        };

        if opens_for_write(flags) && branch > 0 {
            self.promote(path, &result)?;
            result = result.with_branch(0);
            if let Some(attr) = result.attr_mut() {
                attr.mtime = SystemTime::now();
            }
            self.resolver.set(path, result);
            branch = 0;
        }

        let file = self.branches()[branch].open(path, flags)?;
        Ok(self.handles.insert(path, flags, branch, file))
    }

    pub fn create(&self, path: &str, flags: i32, mode: u32) -> Result<(u64, Attr)> {
        self.promote_ancestors(path)?;
        let file = self.writable().create(path, flags, mode)?;
        self.markers.unmark_deleted(path);

        let mut attr = self.cache_upper(path, FileKind::RegularFile, mode);
        attr.perm |= 0o200;
        let fh = self.handles.insert(path, flags, 0, file);
        Ok((fh, attr))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.handles.get(fh)?.read_at(offset, size)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        self.handles.get(fh)?.write_at(offset, data)
    }

    /// Flush a handle; the file's cached resolution is refreshed afterwards
    pub fn flush(&self, fh: u64) -> Result<()> {
        let handle = self.handles.get(fh)?;
        let flushed = handle.flush();
        let path = handle.path();
        if path != DROP_CACHE_NAME {
            self.resolver.resolve_fresh(&path);
        }
        flushed
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        self.handles.get(fh)?.fsync(datasync)
    }

    pub fn handle_attr(&self, fh: u64) -> Result<Attr> {
        self.handles.get(fh)?.get_attr()
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        self.handles.remove(fh).map(|_| ()).ok_or(Error::BadHandle(fh))
    }

    // Namespace changes

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<Attr> {
        if self.resolve_visible(path)?.is_found() {
            return Err(Error::AlreadyExists);
        }

        self.promote_ancestors(path)?;
        self.writable().mkdir(path, mode)?;
        self.markers.unmark_deleted(path);
        let mut attr = self.cache_upper(path, FileKind::Directory, mode);

        // Anything still visible below is left over from a deleted lower copy.
        for entry in self.list_dir(path)? {
            self.markers.mark_deleted(&path::join(path, &entry.name))?;
        }

        attr.perm |= 0o200;
        Ok(attr)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let result = self.resolve_visible(path)?;
        if result.is_dir() {
            return Err(Error::IsADirectory);
        }
        let remaining = match result.branch() {
            None => return Err(Error::NotFound),
            Some(0) => {
                self.writable().unlink(path)?;
                self.resolver.resolve_fresh(path)
            }
            Some(_) => result,
        };

        if remaining.is_lower() {
            self.markers.mark_deleted(path)?;
        }
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let result = self.resolve_visible(path)?;
        let attr = result.status()?;
        if !attr.is_dir() {
            return Err(Error::NotADirectory);
        }
        if !self.list_dir(path)?.is_empty() {
            return Err(Error::DirectoryNotEmpty);
        }

        if result.is_lower() {
            return self.markers.mark_deleted(path);
        }

        self.writable().rmdir(path)?;
        if self.resolver.resolve_fresh(path).is_lower() {
            self.markers.mark_deleted(path)?;
        }
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve_visible(from)?;
        let source_attr = source.status()?.clone();

        let target = self.resolve_visible(to)?;
        if let Some(target_attr) = target.attr() {
            match (source_attr.is_dir(), target_attr.is_dir()) {
                (true, false) => return Err(Error::NotADirectory),
                (false, true) => return Err(Error::IsADirectory),
                (true, true) => {
                    if !self.list_dir(to)?.is_empty() {
                        return Err(Error::DirectoryNotEmpty);
                    }
                }
                (false, false) => {}
            }
        }

        if source_attr.is_dir() {
            return self.rename_dir(from, to, source);
        }

        if source.is_lower() {
            self.promote(from, &source)?;
        }
        self.promote_ancestors(to)?;
        self.writable().rename(from, to)?;
        self.handles.rename(from, to);

        self.markers.unmark_deleted(to);
        self.resolver.invalidate(to);
        if self.resolver.resolve_fresh(from).is_lower() {
            self.markers.mark_deleted(from)?;
        }
        Ok(())
    }

    fn rename_dir(&self, from: &str, to: &str, source: BranchResult) -> Result<()> {
        let moved = self.recursive_promote(from, source)?;
        self.promote_ancestors(to)?;
        self.writable().rename(from, to)?;
        self.handles.rename(from, to);

        for name in &moved {
            let Some(dest) = path::rebase(name, from, to) else {
                continue;
            };
            self.markers.unmark_deleted(&dest);
            match self.writable().get_attr(&dest) {
                Ok(attr) => self.resolver.set(&dest, BranchResult::found(0, attr)),
                Err(_) => self.resolver.invalidate(&dest),
            }
            if self.resolver.resolve_fresh(name).is_lower() {
                self.markers.mark_deleted(name)?;
            }
        }
        Ok(())
    }

    pub fn link(&self, orig: &str, new_name: &str) -> Result<()> {
        let source = self.resolve_visible(orig)?;
        source.status()?;
        if source.is_lower() {
            self.promote(orig, &source)?;
        }
        self.promote_ancestors(new_name)?;
        self.writable().link(orig, new_name)?;

        self.markers.unmark_deleted(new_name);
        self.resolver.resolve_fresh(orig);
        self.resolver.resolve_fresh(new_name);
        Ok(())
    }

    pub fn symlink(&self, target: &str, link_name: &str) -> Result<()> {
        self.promote_ancestors(link_name)?;
        self.writable().symlink(target, link_name)?;
        self.markers.unmark_deleted(link_name);
        self.resolver.resolve_fresh(link_name);
        Ok(())
    }

    // Attribute changes

    /// Promote `result` into branch 0 if it lives below, returning the result
    /// re-homed to branch 0
    fn promote_for_update(&self, path: &str, result: BranchResult) -> Result<BranchResult> {
        if result.is_lower() {
            self.promote(path, &result)?;
        }
        Ok(result.with_branch(0))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let mut result = self.resolve_visible(path)?;
        let perm = (mode & 0o7777) as u16;
        if result.status()?.perm != perm {
            result = self.promote_for_update(path, result)?;
            self.writable().chmod(path, mode & 0o7777)?;
        }
        if let Some(attr) = result.attr_mut() {
            attr.perm = perm;
            attr.ctime = SystemTime::now();
        }
        self.resolver.set(path, result);
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let mut result = self.resolve_visible(path)?;
        let attr = result.status()?;
        let changed =
            uid.is_some_and(|uid| uid != attr.uid) || gid.is_some_and(|gid| gid != attr.gid);
        if changed {
            result = self.promote_for_update(path, result)?;
            self.writable().chown(path, uid, gid)?;
        }
        if let Some(attr) = result.attr_mut() {
            if let Some(uid) = uid {
                attr.uid = uid;
            }
            if let Some(gid) = gid {
                attr.gid = gid;
            }
            attr.ctime = SystemTime::now();
        }
        self.resolver.set(path, result);
        Ok(())
    }

    pub fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let result = self.resolve_visible(path)?;
        result.status()?;
        let mut result = self.promote_for_update(path, result)?;
        self.writable().utimens(path, atime, mtime)?;
        if let Some(attr) = result.attr_mut() {
            attr.set_times(atime, mtime);
        }
        self.resolver.set(path, result);
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        if path == DROP_CACHE_NAME {
            return Ok(());
        }
        let result = self.resolve_visible(path)?;
        result.status()?;
        let mut result = self.promote_for_update(path, result)?;
        self.writable().truncate(path, size)?;
        if let Some(attr) = result.attr_mut() {
            attr.size = size;
            let now = SystemTime::now();
            attr.mtime = now;
            attr.ctime = now;
        }
        self.resolver.set(path, result);
        Ok(())
    }
}

impl std::fmt::Display for UnionFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.branches().iter().map(|b| b.to_string()).collect();
        write!(f, "UnionFs([{}])", names.join(", "))
    }
}
