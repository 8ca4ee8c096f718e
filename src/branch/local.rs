//! Local passthrough branch
//!
//! Maps union paths onto a directory tree on local disk and performs the raw
//! I/O there. Used for the writable branch and for read-only local branches.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

use super::{Attr, Branch, BranchFile, DirEntry, FileKind, StatFs};

/// Pass-through interface to a local directory tree
pub struct LocalBranch {
    root: PathBuf,
}

impl LocalBranch {
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "branch root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a union path to an absolute path under this branch
    pub fn resolve(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    fn c_path(&self, path: &str) -> Result<CString> {
        CString::new(self.resolve(path).as_os_str().as_bytes()).map_err(|_| Error::InvalidName)
    }
}

impl fmt::Display for LocalBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local({})", self.root.display())
    }
}

fn open_options(flags: i32) -> OpenOptions {
    let accmode = flags & libc::O_ACCMODE;
    let mut options = OpenOptions::new();
    options
        .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
        .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
        .custom_flags(flags & !libc::O_ACCMODE);
    options
}

fn to_timespec(time: Option<SystemTime>) -> libc::timespec {
    match time.map(|t| t.duration_since(SystemTime::UNIX_EPOCH)) {
        Some(Ok(since_epoch)) => libc::timespec {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
        },
        Some(Err(_)) => libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

impl Branch for LocalBranch {
    fn get_attr(&self, path: &str) -> Result<Attr> {
        let resolved = self.resolve(path);
        let meta = if path.is_empty() {
            fs::metadata(&resolved)?
        } else {
            fs::symlink_metadata(&resolved)?
        };
        Ok(Attr::from_metadata(&meta))
    }

    fn open(&self, path: &str, flags: i32) -> Result<Box<dyn BranchFile>> {
        let flags = flags & !(libc::O_CREAT | libc::O_EXCL);
        let file = open_options(flags).open(self.resolve(path))?;
        Ok(Box::new(LocalFile::new(file)))
    }

    fn create(&self, path: &str, flags: i32, mode: u32) -> Result<Box<dyn BranchFile>> {
        let file = open_options(flags | libc::O_CREAT)
            .mode(mode & 0o7777)
            .open(self.resolve(path))?;
        Ok(Box::new(LocalFile::new(file)))
    }

    fn open_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!("{}: skipping non UTF-8 name {:?} in {:?}", self, raw, path);
                    continue;
                }
            };
            let kind = FileKind::from(entry.file_type()?);
            entries.push(DirEntry { name, kind });
        }
        Ok(entries)
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(self.resolve(path))?;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        fs::remove_dir(self.resolve(path))?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))?;
        Ok(())
    }

    fn link(&self, orig: &str, new_name: &str) -> Result<()> {
        fs::hard_link(self.resolve(orig), self.resolve(new_name))?;
        Ok(())
    }

    fn symlink(&self, target: &str, link_name: &str) -> Result<()> {
        std::os::unix::fs::symlink(target, self.resolve(link_name))?;
        Ok(())
    }

    fn readlink(&self, path: &str) -> Result<String> {
        fs::read_link(self.resolve(path))?
            .into_os_string()
            .into_string()
            .map_err(|_| Error::InvalidName)
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        fs::set_permissions(self.resolve(path), fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        std::os::unix::fs::lchown(self.resolve(path), uid, gid)?;
        Ok(())
    }

    fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let c_path = self.c_path(path)?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn truncate(&self, path: &str, size: u64) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .open(self.resolve(path))?
            .set_len(size)?;
        Ok(())
    }

    fn access(&self, path: &str, mask: i32) -> Result<()> {
        let flags = nix::unistd::AccessFlags::from_bits_truncate(mask);
        nix::unistd::access(&self.resolve(path), flags)?;
        Ok(())
    }

    fn get_xattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let c_path = self.c_path(path)?;
        let c_name = CString::new(name).map_err(|_| Error::InvalidName)?;

        let size = unsafe {
            libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
        };
        if size < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut buffer = vec![0u8; size as usize];
        let read = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
            )
        };
        if read < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        buffer.truncate(read as usize);
        Ok(buffer)
    }

    fn list_xattr(&self, path: &str) -> Result<Vec<String>> {
        let c_path = self.c_path(path)?;

        let size = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut buffer = vec![0u8; size as usize];
        let read = unsafe {
            libc::llistxattr(c_path.as_ptr(), buffer.as_mut_ptr().cast(), buffer.len())
        };
        if read < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        buffer.truncate(read as usize);

        Ok(buffer
            .split(|b| *b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect())
    }

    fn statfs(&self, path: &str) -> Result<StatFs> {
        let stat = nix::sys::statvfs::statvfs(&self.resolve(path))?;
        Ok(StatFs {
            blocks: stat.blocks() as u64,
            bfree: stat.blocks_free() as u64,
            bavail: stat.blocks_available() as u64,
            files: stat.files() as u64,
            ffree: stat.files_free() as u64,
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
            frsize: stat.fragment_size() as u32,
        })
    }
}

/// A file opened in a local branch
pub struct LocalFile {
    file: File,
}

impl LocalFile {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl BranchFile for LocalFile {
    fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self.file.read_at(&mut buffer[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32> {
        self.file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn fsync(&self, datasync: bool) -> Result<()> {
        if datasync {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn set_len(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn get_attr(&self) -> Result<Attr> {
        Ok(Attr::from_metadata(&self.file.metadata()?))
    }
}
