//! Remote (object-store backed) read-only branch
//!
//! The objects of a remote volume are mirrored into a local directory by the
//! object-store client; this branch serves lookups from that mirror and caches
//! attribute, directory, symlink and xattr results so repeated lookups do not
//! cost a round trip. Caches live until the TTL passes or the branch is told
//! to drop them.

use crate::cache::{Clock, TimedCache};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;

use super::{Attr, Branch, BranchFile, DirEntry, FileKind, StatFs, DROP_CACHE_NAME};

/// Separates path and attribute name in xattr cache keys
const XATTR_KEY_SEP: &str = "\0";

/// Read-only branch with cached lookups
pub struct RemoteBranch {
    inner: Arc<dyn Branch>,
    endpoint: Option<String>,
    attrs: TimedCache<String, Result<Attr>>,
    dirs: TimedCache<String, Result<Vec<DirEntry>>>,
    links: TimedCache<String, Result<String>>,
    xattrs: TimedCache<String, Result<Vec<u8>>>,
}

fn cacheable<T>(result: Result<T>) -> (Result<T>, bool) {
    let ok = result.is_ok();
    (result, ok)
}

impl RemoteBranch {
    pub fn new(
        inner: Arc<dyn Branch>,
        endpoint: Option<String>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            endpoint,
            attrs: TimedCache::with_clock(ttl, Arc::clone(&clock)),
            dirs: TimedCache::with_clock(ttl, Arc::clone(&clock)),
            links: TimedCache::with_clock(ttl, Arc::clone(&clock)),
            xattrs: TimedCache::with_clock(ttl, clock),
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

impl fmt::Display for RemoteBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(endpoint) => write!(f, "remote({}, {})", endpoint, self.inner),
            None => write!(f, "remote({})", self.inner),
        }
    }
}

impl Branch for RemoteBranch {
    fn get_attr(&self, path: &str) -> Result<Attr> {
        if path == DROP_CACHE_NAME {
            return Ok(Attr::new(FileKind::RegularFile, 0o777));
        }
        self.attrs
            .get(&path.to_string(), |p| cacheable(self.inner.get_attr(p)))
    }

    fn open(&self, path: &str, flags: i32) -> Result<Box<dyn BranchFile>> {
        if path == DROP_CACHE_NAME {
            let accmode = flags & libc::O_ACCMODE;
            if accmode != libc::O_RDONLY {
                self.drop_cache();
            }
        }
        self.inner.open(path, flags)
    }

    fn create(&self, _path: &str, _flags: i32, _mode: u32) -> Result<Box<dyn BranchFile>> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn open_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.dirs
            .get(&path.to_string(), |p| cacheable(self.inner.open_dir(p)))
    }

    fn mkdir(&self, _path: &str, _mode: u32) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn rmdir(&self, _path: &str) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn unlink(&self, _path: &str) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn link(&self, _orig: &str, _new_name: &str) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn symlink(&self, _target: &str, _link_name: &str) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn readlink(&self, path: &str) -> Result<String> {
        self.links
            .get(&path.to_string(), |p| cacheable(self.inner.readlink(p)))
    }

    fn chmod(&self, _path: &str, _mode: u32) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn chown(&self, _path: &str, _uid: Option<u32>, _gid: Option<u32>) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn utimens(
        &self,
        _path: &str,
        _atime: Option<SystemTime>,
        _mtime: Option<SystemTime>,
    ) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn truncate(&self, _path: &str, _size: u64) -> Result<()> {
        Err(Error::ReadOnlyFilesystem)
    }

    fn access(&self, path: &str, mask: i32) -> Result<()> {
        self.inner.access(path, mask)
    }

    fn get_xattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let key = format!("{}{}{}", path, XATTR_KEY_SEP, name);
        self.xattrs.get(&key, |k| {
            let (path, name) = k.split_once(XATTR_KEY_SEP).unwrap_or((k.as_str(), ""));
            cacheable(self.inner.get_xattr(path, name))
        })
    }

    fn list_xattr(&self, path: &str) -> Result<Vec<String>> {
        self.inner.list_xattr(path)
    }

    fn statfs(&self, path: &str) -> Result<StatFs> {
        self.inner.statfs(path)
    }

    fn drop_cache(&self) {
        info!("Dropping cache for {}", self);
        self.attrs.drop_all(None);
        self.dirs.drop_all(None);
        self.links.drop_all(None);
        self.xattrs.drop_all(None);
        self.inner.drop_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::LocalBranch;
    use crate::cache::{ManualClock, MonotonicClock};
    use std::fs;
    use tempfile::tempdir;

    fn remote_with_clock(
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> (tempfile::TempDir, RemoteBranch) {
        let dir = tempdir().unwrap();
        let local = LocalBranch::new(dir.path().to_path_buf()).unwrap();
        let endpoint = Some("objects:7000".into());
        let branch = RemoteBranch::new(Arc::new(local), endpoint, ttl, clock);
        (dir, branch)
    }

    fn remote(ttl: Duration) -> (tempfile::TempDir, RemoteBranch) {
        remote_with_clock(ttl, Arc::new(MonotonicClock))
    }

    #[test]
    fn test_cached_lookups_follow_the_clock() {
        let clock = Arc::new(ManualClock::new());
        let (dir, branch) = remote_with_clock(Duration::from_secs(30), clock.clone());
        fs::write(dir.path().join("obj"), b"v1").unwrap();
        assert_eq!(branch.get_attr("obj").unwrap().size, 2);
        assert_eq!(branch.open_dir("").unwrap().len(), 1);

        fs::write(dir.path().join("obj"), b"version2").unwrap();
        fs::write(dir.path().join("other"), b"x").unwrap();
        clock.advance(Duration::from_secs(29));
        assert_eq!(branch.get_attr("obj").unwrap().size, 2);
        assert_eq!(branch.open_dir("").unwrap().len(), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(branch.get_attr("obj").unwrap().size, 8);
        assert_eq!(branch.open_dir("").unwrap().len(), 2);
    }

    #[test]
    fn test_attributes_are_cached_until_dropped() {
        let (dir, branch) = remote(Duration::ZERO);
        fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        assert_eq!(branch.get_attr("a.txt").unwrap().size, 2);

        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        assert_eq!(branch.get_attr("a.txt").unwrap().size, 2);

        branch.drop_cache();
        assert_eq!(branch.get_attr("a.txt").unwrap().size, 5);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let (dir, branch) = remote(Duration::ZERO);
        assert!(branch.get_attr("late.txt").unwrap_err().is_not_found());

        fs::write(dir.path().join("late.txt"), b"x").unwrap();
        assert!(branch.get_attr("late.txt").is_ok());
    }

    #[test]
    fn test_directory_listing_cached() {
        let (dir, branch) = remote(Duration::ZERO);
        fs::write(dir.path().join("one"), b"1").unwrap();
        assert_eq!(branch.open_dir("").unwrap().len(), 1);

        fs::write(dir.path().join("two"), b"2").unwrap();
        assert_eq!(branch.open_dir("").unwrap().len(), 1);

        branch.open(DROP_CACHE_NAME, libc::O_WRONLY).ok();
        assert_eq!(branch.open_dir("").unwrap().len(), 2);
    }

    #[test]
    fn test_sentinel_reports_regular_file() {
        let (_dir, branch) = remote(Duration::ZERO);
        let attr = branch.get_attr(DROP_CACHE_NAME).unwrap();
        assert!(attr.is_file());
    }

    #[test]
    fn test_writes_are_rejected() {
        let (_dir, branch) = remote(Duration::ZERO);
        assert!(matches!(branch.mkdir("d", 0o755), Err(Error::ReadOnlyFilesystem)));
        assert!(matches!(branch.unlink("x"), Err(Error::ReadOnlyFilesystem)));
    }
}
