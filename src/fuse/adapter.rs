//! FUSE filesystem implementation over the union

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::inode::{InodeTable, ROOT_INO};
use crate::branch::{Attr, FileKind, DROP_CACHE_NAME};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::union::{opens_for_write, path, UnionFs};

/// One entry of an open directory snapshot
struct DirSlot {
    ino: u64,
    kind: fuser::FileType,
    name: String,
}

/// Inode-addressed adapter between the kernel and [`UnionFs`]
pub struct FuseAdapter {
    fs: Arc<UnionFs>,
    inodes: InodeTable,
    /// Directory listings taken at opendir, so readdir offsets stay stable
    dirs: HashMap<u64, Vec<DirSlot>>,
    next_dir_fh: u64,
    entry_ttl: Duration,
    negative_ttl: Duration,
}

impl FuseAdapter {
    pub fn new(fs: Arc<UnionFs>, cache: &CacheConfig) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            dirs: HashMap::new(),
            next_dir_fh: 1,
            entry_ttl: cache.entry_ttl(),
            negative_ttl: cache.negative_ttl(),
        }
    }

    fn path_of(&self, ino: u64) -> Result<String> {
        self.inodes.path(ino).ok_or(Error::NotFound)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String> {
        let parent = self.path_of(parent)?;
        let name = name.to_str().ok_or(Error::InvalidName)?;
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidName);
        }
        Ok(path::join(&parent, name))
    }

    fn file_attr(&self, ino: u64, attr: &Attr) -> FileAttr {
        attr.to_fuser_attr(ino)
    }

    /// Reply to a lookup-like request with a fresh entry for `path`
    fn reply_entry(&self, path: &str, attr: &Attr, reply: ReplyEntry) {
        let ino = self.inodes.lookup(path);
        reply.entry(&self.entry_ttl, &self.file_attr(ino, attr), 0);
    }

    fn reply_new_entry(&self, path: &str, reply: ReplyEntry) {
        match self.fs.get_attr(path) {
            Ok(attr) => self.reply_entry(path, &attr, reply),
            Err(e) => reply.error(errno("lookup", path, &e)),
        }
    }

    /// Snapshot the listing of directory `ino` under a new directory handle
    fn open_listing(&mut self, ino: u64) -> Result<u64> {
        let path = self.path_of(ino)?;
        let entries = self.fs.list_dir(&path)?;

        let parent_ino = if ino == ROOT_INO {
            ROOT_INO
        } else {
            self.inodes.peek_or_assign(path::parent(&path))
        };
        let mut slots = vec![
            DirSlot {
                ino,
                kind: fuser::FileType::Directory,
                name: ".".to_string(),
            },
            DirSlot {
                ino: parent_ino,
                kind: fuser::FileType::Directory,
                name: "..".to_string(),
            },
        ];
        slots.extend(entries.into_iter().map(|entry| DirSlot {
            ino: self.inodes.peek_or_assign(&path::join(&path, &entry.name)),
            kind: entry.kind.to_fuser_type(),
            name: entry.name,
        }));

        let fh = self.next_dir_fh;
        self.next_dir_fh += 1;
        self.dirs.insert(fh, slots);
        Ok(fh)
    }

    /// Drop a listing snapshot. Listed inodes the kernel never looked up are
    /// released unless another open listing still hands them out.
    fn close_listing(&mut self, fh: u64) -> usize {
        let Some(slots) = self.dirs.remove(&fh) else {
            return 0;
        };
        let in_use: HashSet<u64> = self.dirs.values().flatten().map(|s| s.ino).collect();
        let listed: Vec<u64> = slots
            .iter()
            .map(|s| s.ino)
            .filter(|ino| !in_use.contains(ino))
            .collect();
        let released = self.inodes.release_unreferenced(&listed);
        debug!("released {} unreferenced inodes with listing {}", released, fh);
        released
    }

    /// Forget inodes whose paths no longer resolve
    fn prune_inodes(&self) {
        let fs = &self.fs;
        let pruned = self.inodes.retain(|path| fs.get_attr(path).is_ok());
        info!("dropped {} stale inodes", pruned);
    }
}

/// Log a failed request and return the errno for the kernel
fn errno(op: &str, path: &str, e: &Error) -> c_int {
    match e {
        Error::NotFound | Error::NoData | Error::AlreadyExists => {
            debug!("{}({:?}): {}", op, path, e)
        }
        _ => error!("{}({:?}) failed: {}", op, path, e),
    }
    e.to_errno()
}

fn to_system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for FuseAdapter {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), c_int> {
        info!("mounted {}", self.fs);
        Ok(())
    }

    fn destroy(&mut self) {
        info!("unmounting {}", self.fs);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e.to_errno()),
        };
        match self.fs.get_attr(&path) {
            Ok(attr) => self.reply_entry(&path, &attr, reply),
            Err(Error::NotFound) if !self.negative_ttl.is_zero() => {
                // Inode 0 tells the kernel to cache the miss.
                let negative = Attr::new(FileKind::RegularFile, 0).to_fuser_attr(0);
                reply.entry(&self.negative_ttl, &negative, 0);
            }
            Err(e) => reply.error(errno("lookup", &path, &e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.path_of(ino).and_then(|path| self.fs.get_attr(&path)) {
            Ok(attr) => reply.attr(&self.entry_ttl, &self.file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );

        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e.to_errno()),
        };

        let result = (|| -> Result<Attr> {
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.fs.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.fs
                    .utimens(&path, atime.map(to_system_time), mtime.map(to_system_time))?;
            }
            self.fs.get_attr(&path)
        })();

        match result {
            Ok(attr) => reply.attr(&self.entry_ttl, &self.file_attr(ino, &attr)),
            Err(e) => reply.error(errno("setattr", &path, &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.path_of(ino).and_then(|path| self.fs.readlink(&path)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e.to_errno()),
        };
        match self.fs.mkdir(&path, mode & !umask & 0o7777) {
            Ok(attr) => self.reply_entry(&path, &attr, reply),
            Err(e) => reply.error(errno("mkdir", &path, &e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e.to_errno()),
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.unlink_path(&path);
                reply.ok()
            }
            Err(e) => reply.error(errno("unlink", &path, &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e.to_errno()),
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.unlink_path(&path);
                reply.ok()
            }
            Err(e) => reply.error(errno("rmdir", &path, &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let path = match self.child_path(parent, link_name) {
            Ok(path) => path,
            Err(e) => return reply.error(e.to_errno()),
        };
        let Some(target) = target.to_str() else {
            return reply.error(Error::InvalidName.to_errno());
        };
        match self.fs.symlink(target, &path) {
            Ok(()) => self.reply_new_entry(&path, reply),
            Err(e) => reply.error(errno("symlink", &path, &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        if flags != 0 {
            return reply.error(Error::Unsupported.to_errno());
        }
        let paths = (self.child_path(parent, name), self.child_path(newparent, newname));
        let (from, to) = match paths {
            (Ok(from), Ok(to)) => (from, to),
            (Err(e), _) | (_, Err(e)) => return reply.error(e.to_errno()),
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok()
            }
            Err(e) => reply.error(errno("rename", &from, &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        let (orig, new_path) = match (self.path_of(ino), self.child_path(newparent, newname)) {
            (Ok(orig), Ok(new_path)) => (orig, new_path),
            (Err(e), _) | (_, Err(e)) => return reply.error(e.to_errno()),
        };
        match self.fs.link(&orig, &new_path) {
            Ok(()) => self.reply_new_entry(&new_path, reply),
            Err(e) => reply.error(errno("link", &new_path, &e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e.to_errno()),
        };
        match self.fs.open(&path, flags) {
            Ok(fh) => {
                if path == DROP_CACHE_NAME && opens_for_write(flags) {
                    self.prune_inodes();
                }
                reply.opened(fh, 0)
            }
            Err(e) => reply.error(errno("open", &path, &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        match self.fs.read(fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &ino.to_string(), &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        match self.fs.write(fh, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno("write", &ino.to_string(), &e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &ino.to_string(), &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);

        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &ino.to_string(), &e)),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        match self.fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &ino.to_string(), &e)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);

        match self.open_listing(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("opendir", &ino.to_string(), &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);

        let Some(slots) = self.dirs.get(&fh) else {
            return reply.error(Error::BadHandle(fh).to_errno());
        };
        for (i, slot) in slots.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(slot.ino, (i + 1) as i64, slot.kind, &slot.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={}, fh={})", ino, fh);
        self.close_listing(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(e) => reply.error(errno("statfs", "", &e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);

        let result = self.path_of(ino).and_then(|path| {
            let name = name.to_str().ok_or(Error::NoData)?;
            self.fs.get_xattr(&path, name)
        });
        match result {
            Ok(value) if size == 0 => reply.size(value.len() as u32),
            Ok(value) if value.len() > size as usize => reply.error(libc::ERANGE),
            Ok(value) => reply.data(&value),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);

        let result = self
            .path_of(ino)
            .and_then(|path| self.fs.list_xattr(&path));
        let names = match result {
            Ok(names) => names,
            Err(e) => return reply.error(e.to_errno()),
        };

        let mut packed = Vec::new();
        for name in names {
            packed.extend_from_slice(name.as_bytes());
            packed.push(0);
        }
        if size == 0 {
            reply.size(packed.len() as u32);
        } else if packed.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&packed);
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        match self.path_of(ino).and_then(|path| self.fs.access(&path, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e.to_errno()),
        };
        match self.fs.create(&path, flags, mode & !umask & 0o7777) {
            Ok((fh, attr)) => {
                let ino = self.inodes.lookup(&path);
                reply.created(&self.entry_ttl, &self.file_attr(ino, &attr), 0, fh, 0);
            }
            Err(e) => reply.error(errno("create", &path, &e)),
        }
    }
}
