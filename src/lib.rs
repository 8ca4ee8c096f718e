//! branchfs - Union filesystem over local and remote branches
//!
//! Stacks a writable local directory on top of any number of read-only
//! branches. Modified files are copied up into the writable branch and
//! deletions of read-only entries are recorded as marker files, so the
//! read-only branches are never touched.

pub mod branch;
pub mod cache;
pub mod config;
pub mod error;
pub mod fuse;
pub mod union;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::branch::{Attr, Branch, FileKind, LocalBranch, RemoteBranch};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::union::{BranchResult, UnionFs};
}
