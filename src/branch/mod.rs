//! Branch backends
//!
//! A branch is one layer of the union. Every branch speaks the same
//! path-addressed interface ([`Branch`]); paths are relative to the branch
//! root, use `/` as separator, and the empty string names the root itself.
//!
//! - [`LocalBranch`]: passthrough to a directory tree on local disk
//! - [`RemoteBranch`]: read-only branch mirrored from an object store, with
//!   lookups cached to amortise round trips

mod attr;
mod local;
mod remote;

pub use attr::{Attr, FileKind};
pub use local::{LocalBranch, LocalFile};
pub use remote::RemoteBranch;

use crate::cache::Clock;
use crate::config::{BranchConfig, BranchKind, Config};
use crate::error::Result;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Name of the control file that drops caches when opened for writing
pub const DROP_CACHE_NAME: &str = ".drop_cache";

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Filesystem statistics, in the shape of `statvfs`
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// An open file within a branch
///
/// Reads and writes are positional so one handle can serve concurrent
/// requests without seeking.
pub trait BranchFile: Send + Sync {
    fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>>;
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32>;
    fn flush(&self) -> Result<()>;
    fn fsync(&self, datasync: bool) -> Result<()>;
    fn set_len(&self, size: u64) -> Result<()>;
    fn get_attr(&self) -> Result<Attr>;
}

/// Path-addressed filesystem operations provided by every branch
pub trait Branch: fmt::Display + Send + Sync {
    fn get_attr(&self, path: &str) -> Result<Attr>;

    /// Open an existing file with raw `open(2)` flags
    fn open(&self, path: &str, flags: i32) -> Result<Box<dyn BranchFile>>;

    /// Create (or open, per `flags`) a regular file
    fn create(&self, path: &str, flags: i32, mode: u32) -> Result<Box<dyn BranchFile>>;

    fn open_dir(&self, path: &str) -> Result<Vec<DirEntry>>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn link(&self, orig: &str, new_name: &str) -> Result<()>;
    fn symlink(&self, target: &str, link_name: &str) -> Result<()>;
    fn readlink(&self, path: &str) -> Result<String>;
    fn chmod(&self, path: &str, mode: u32) -> Result<()>;
    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()>;
    fn utimens(&self, path: &str, atime: Option<SystemTime>, mtime: Option<SystemTime>)
        -> Result<()>;
    fn truncate(&self, path: &str, size: u64) -> Result<()>;
    fn access(&self, path: &str, mask: i32) -> Result<()>;
    fn get_xattr(&self, path: &str, name: &str) -> Result<Vec<u8>>;
    fn list_xattr(&self, path: &str) -> Result<Vec<String>>;
    fn statfs(&self, path: &str) -> Result<StatFs>;

    /// Forget any cached lookups. Branches without caches ignore this.
    fn drop_cache(&self) {}
}

/// Build the branch list described by the configuration, in priority order.
/// Remote branches expire their lookups against `clock`.
pub fn open_branches(config: &Config, clock: Arc<dyn Clock>) -> Result<Vec<Arc<dyn Branch>>> {
    let remote_ttl = config.cache.remote_ttl();
    config
        .branches
        .iter()
        .map(|branch| open_branch(branch, remote_ttl, &clock))
        .collect()
}

fn open_branch(
    config: &BranchConfig,
    remote_ttl: Duration,
    clock: &Arc<dyn Clock>,
) -> Result<Arc<dyn Branch>> {
    let local: Arc<dyn Branch> = Arc::new(LocalBranch::new(config.root.clone())?);
    let branch: Arc<dyn Branch> = match config.kind {
        BranchKind::Local => local,
        BranchKind::Remote => Arc::new(RemoteBranch::new(
            local,
            config.endpoint.clone(),
            remote_ttl,
            Arc::clone(clock),
        )),
    };
    Ok(branch)
}
