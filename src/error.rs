//! Error types for branchfs
//!
//! Branch-level failures are classified into a small taxonomy so the union
//! layer can make decisions on them (e.g. "not found in this branch, try the
//! next one") and so every failure maps onto one errno for the kernel.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type used throughout branchfs
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by branches and the union layer.
///
/// Errors are `Clone` because resolution results are cached and handed out
/// by value.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No branch owns the path
    #[error("No such file or directory")]
    NotFound,

    #[error("File exists")]
    AlreadyExists,

    #[error("Not a directory")]
    NotADirectory,

    #[error("Is a directory")]
    IsADirectory,

    #[error("Directory not empty")]
    DirectoryNotEmpty,

    #[error("Permission denied")]
    PermissionDenied,

    /// The writable branch cannot hold the state the union needs
    #[error("Read-only filesystem")]
    ReadOnlyFilesystem,

    /// File type the union cannot copy up
    #[error("Operation not supported")]
    Unsupported,

    /// Extended attribute not present
    #[error("No data available")]
    NoData,

    /// Name is not valid UTF-8 or contains a separator
    #[error("Invalid file name")]
    InvalidName,

    #[error("Invalid file handle: {0}")]
    BadHandle(u64),

    /// Unclassified I/O error from a branch
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to a libc error code for FUSE replies
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::AlreadyExists => libc::EEXIST,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::DirectoryNotEmpty => libc::ENOTEMPTY,
            Error::PermissionDenied => libc::EPERM,
            Error::ReadOnlyFilesystem => libc::EROFS,
            Error::Unsupported => libc::ENOSYS,
            Error::NoData => libc::ENODATA,
            Error::InvalidName => libc::EINVAL,
            Error::BadHandle(_) => libc::EBADF,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Config(_) | Error::InvalidConfig(_) | Error::Internal(_) => libc::EIO,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::ENOENT) => return Error::NotFound,
            Some(libc::EEXIST) => return Error::AlreadyExists,
            Some(libc::ENOTDIR) => return Error::NotADirectory,
            Some(libc::EISDIR) => return Error::IsADirectory,
            Some(libc::ENOTEMPTY) => return Error::DirectoryNotEmpty,
            Some(libc::EPERM) => return Error::PermissionDenied,
            Some(libc::EROFS) => return Error::ReadOnlyFilesystem,
            Some(libc::ENODATA) => return Error::NoData,
            Some(_) => return Error::Io(Arc::new(e)),
            None => {}
        }
        match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::AlreadyExists => Error::AlreadyExists,
            _ => Error::Io(Arc::new(e)),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        io::Error::from_raw_os_error(e as i32).into()
    }
}
