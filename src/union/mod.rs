//! Union of branches
//!
//! - [`BranchResolver`]: which branch owns a path
//! - [`Markers`]: deletion markers for entries of read-only branches
//! - [`HandleTable`]: open files, kept valid across copy-up and rename
//! - [`UnionFs`]: the operations, including copy-up (`promote`)

mod filesystem;
mod handle;
mod marker;
pub mod path;
mod promote;
mod resolver;

pub use filesystem::UnionFs;
pub use handle::{opens_for_write, HandleTable, NullFile, UnionFile};
pub use marker::{deleted_paths, marker_name, Markers};
pub use resolver::{BranchResolver, BranchResult};
