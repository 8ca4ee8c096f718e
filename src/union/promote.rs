//! Copy-up of entries from read-only branches into the writable branch

use crate::branch::{Attr, Branch, FileKind};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use super::filesystem::UnionFs;
use super::handle::reopen_flags;
use super::path;
use super::resolver::BranchResult;

/// Chunk size for copying file contents
const COPY_CHUNK: u32 = 128 * 1024;

impl UnionFs {
    /// Copy `path` into the writable branch
    ///
    /// Directories are created empty; their children stay where they are.
    /// Open handles on a promoted regular file are moved to the new copy.
    pub fn promote(&self, path: &str, result: &BranchResult) -> Result<()> {
        let source_index = match result.branch() {
            None => return Err(Error::NotFound),
            Some(0) => return Ok(()),
            Some(index) => index,
        };
        let attr = result.status()?.clone();
        let source = Arc::clone(&self.branches()[source_index]);

        debug!("promoting {:?} from branch {}", path, source_index);
        let outcome = self
            .promote_ancestors(path)
            .and_then(|_| self.copy_entry(source.as_ref(), path, &attr));

        match outcome {
            Ok(()) => {
                let promoted = match self.writable().get_attr(path) {
                    Ok(fresh) => BranchResult::found(0, fresh),
                    Err(_) => result.clone().with_branch(0),
                };
                self.resolver.set(path, promoted);
                Ok(())
            }
            Err(e) => {
                warn!("promoting {:?} failed: {}", path, e);
                self.resolver.resolve_fresh(path);
                Err(e)
            }
        }
    }

    fn copy_entry(&self, source: &dyn Branch, path: &str, attr: &Attr) -> Result<()> {
        let writable = self.writable();
        match attr.kind {
            FileKind::RegularFile => {
                copy_contents(source, writable.as_ref(), path, attr)?;
                writable.chmod(path, u32::from(attr.perm & 0o7777) | 0o200)?;
                writable.utimens(path, Some(attr.atime), Some(attr.mtime))?;
                self.migrate_handles(path)
            }
            FileKind::Symlink => {
                let target = source.readlink(path).map_err(|e| {
                    warn!("can't read link {:?} in {}: {}", path, source, e);
                    e
                })?;
                writable.symlink(&target, path)
            }
            FileKind::Directory => writable.mkdir(path, u32::from(attr.perm & 0o7777) | 0o200),
            other => {
                warn!("cannot promote {:?}: unsupported file type {:?}", path, other);
                Err(Error::Unsupported)
            }
        }
    }

    /// Point handles still backed by a read-only branch at the promoted copy
    fn migrate_handles(&self, path: &str) -> Result<()> {
        for handle in self.handles.open_on(path) {
            if handle.branch() == 0 {
                continue;
            }
            let file = self.writable().open(path, reopen_flags(handle.flags()))?;
            let old = handle.replace(0, file);
            if let Err(e) = old.flush() {
                debug!("flushing replaced handle for {:?}: {}", path, e);
            }
        }
        Ok(())
    }

    /// Make sure every directory above `path` exists in the writable branch
    pub fn promote_ancestors(&self, path: &str) -> Result<()> {
        let mut todo = Vec::new();
        for dir in path::ancestors(path) {
            let result = self.resolve_visible(dir)?;
            if !result.is_found() {
                warn!("path component {:?} of {:?} does not exist", dir, path);
                return Err(Error::NotFound);
            }
            if !result.is_dir() {
                warn!("path component {:?} of {:?} is not a directory", dir, path);
                return Err(Error::PermissionDenied);
            }
            if result.branch() == Some(0) {
                break;
            }
            todo.push((dir, result));
        }

        let writable = self.writable();
        for (dir, result) in todo.into_iter().rev() {
            let attr = result.status()?;
            if let Err(e) = writable.mkdir(dir, u32::from(attr.perm & 0o7777) | 0o200) {
                warn!("error creating directory {:?} on {}: {}", dir, writable, e);
                return Err(Error::PermissionDenied);
            }
            if let Err(e) = writable.utimens(dir, Some(attr.atime), Some(attr.mtime)) {
                debug!("utimens {:?}: {}", dir, e);
            }
            self.resolver.set(dir, result.with_branch(0));
        }
        Ok(())
    }

    /// Promote `path` and, for directories, everything visible below it.
    /// Returns every path visited, parents before children.
    pub fn recursive_promote(&self, path: &str, result: BranchResult) -> Result<Vec<String>> {
        if result.is_lower() {
            self.promote(path, &result)?;
        }

        let mut names = vec![path.to_string()];
        if result.is_dir() {
            for entry in self.list_dir(path)? {
                let child = path::join(path, &entry.name);
                let child_result = self.resolver.resolve(&child);
                names.extend(self.recursive_promote(&child, child_result)?);
            }
        }
        Ok(names)
    }
}

fn copy_contents(source: &dyn Branch, dest: &dyn Branch, path: &str, attr: &Attr) -> Result<()> {
    let input = source.open(path, libc::O_RDONLY)?;
    let output = dest.create(
        path,
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
        u32::from(attr.perm & 0o7777) | 0o200,
    )?;

    let mut offset = 0u64;
    loop {
        let chunk = input.read_at(offset, COPY_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        let written = output.write_at(offset, &chunk)?;
        assert_eq!(
            written as usize,
            chunk.len(),
            "short write while copying {:?} to {}",
            path,
            dest
        );
        offset += chunk.len() as u64;
    }
    output.flush()
}
