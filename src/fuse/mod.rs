//! Kernel interface
//!
//! Exposes a [`UnionFs`](crate::union::UnionFs) through FUSE. The kernel
//! speaks in inode numbers; [`InodeTable`] maps them to union paths.

mod adapter;
mod inode;

pub use adapter::FuseAdapter;
pub use inode::{InodeTable, ROOT_INO};
