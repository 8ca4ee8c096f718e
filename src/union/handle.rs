//! Open file tracking
//!
//! Every open of a union file gets a handle id that stays stable for the
//! lifetime of the open, even when the file underneath is copied up to the
//! writable branch or renamed.

use crate::branch::{Attr, BranchFile, FileKind};
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::path;

/// Whether `flags` can modify the file
pub fn opens_for_write(flags: i32) -> bool {
    let accmode = flags & libc::O_ACCMODE;
    accmode == libc::O_WRONLY
        || accmode == libc::O_RDWR
        || flags & (libc::O_APPEND | libc::O_CREAT | libc::O_TRUNC) != 0
}

/// Flags for reopening an already open file elsewhere
pub fn reopen_flags(flags: i32) -> i32 {
    flags & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC)
}

struct Backing {
    branch: usize,
    file: Box<dyn BranchFile>,
}

/// One open union file
pub struct UnionFile {
    path: RwLock<String>,
    flags: i32,
    backing: RwLock<Backing>,
}

impl UnionFile {
    fn new(path: String, flags: i32, branch: usize, file: Box<dyn BranchFile>) -> Self {
        Self {
            path: RwLock::new(path),
            flags,
            backing: RwLock::new(Backing { branch, file }),
        }
    }

    pub fn path(&self) -> String {
        self.path.read().clone()
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Branch currently backing the handle
    pub fn branch(&self) -> usize {
        self.backing.read().branch
    }

    pub fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.backing.read().file.read_at(offset, size)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32> {
        self.backing.read().file.write_at(offset, data)
    }

    pub fn flush(&self) -> Result<()> {
        self.backing.read().file.flush()
    }

    pub fn fsync(&self, datasync: bool) -> Result<()> {
        self.backing.read().file.fsync(datasync)
    }

    pub fn set_len(&self, size: u64) -> Result<()> {
        self.backing.read().file.set_len(size)
    }

    /// Attributes of the open file, with the owner write bit set
    pub fn get_attr(&self) -> Result<Attr> {
        let mut attr = self.backing.read().file.get_attr()?;
        attr.perm |= 0o200;
        Ok(attr)
    }

    /// Swap in a file from another branch, returning the old one
    pub fn replace(&self, branch: usize, file: Box<dyn BranchFile>) -> Box<dyn BranchFile> {
        let mut backing = self.backing.write();
        backing.branch = branch;
        std::mem::replace(&mut backing.file, file)
    }
}

/// File behind the drop-cache sentinel: reads nothing, swallows writes
pub struct NullFile;

impl BranchFile for NullFile {
    fn read_at(&self, _offset: u64, _size: u32) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn write_at(&self, _offset: u64, data: &[u8]) -> Result<u32> {
        Ok(data.len() as u32)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn fsync(&self, _datasync: bool) -> Result<()> {
        Ok(())
    }

    fn set_len(&self, _size: u64) -> Result<()> {
        Ok(())
    }

    fn get_attr(&self) -> Result<Attr> {
        Ok(Attr::new(FileKind::RegularFile, 0o777))
    }
}

/// Table of open union files
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: DashMap<u64, Arc<UnionFile>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: DashMap::new(),
        }
    }

    /// Register an open file and return its handle id
    pub fn insert(&self, path: &str, flags: i32, branch: usize, file: Box<dyn BranchFile>) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        let handle = UnionFile::new(path.to_string(), flags, branch, file);
        self.handles.insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Arc<UnionFile>> {
        self.handles
            .get(&fh)
            .map(|h| Arc::clone(h.value()))
            .ok_or(Error::BadHandle(fh))
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<UnionFile>> {
        self.handles.remove(&fh).map(|(_, h)| h)
    }

    /// Handles currently open on `path`
    pub fn open_on(&self, path: &str) -> Vec<Arc<UnionFile>> {
        self.handles
            .iter()
            .filter(|h| *h.value().path.read() == path)
            .map(|h| Arc::clone(h.value()))
            .collect()
    }

    /// Make handles under `from` follow a rename to `to`
    pub fn rename(&self, from: &str, to: &str) {
        for entry in self.handles.iter() {
            let mut current = entry.value().path.write();
            if let Some(moved) = path::rebase(&current, from, to) {
                *current = moved;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
