//! Branch resolution
//!
//! Decides which branch currently owns a path. The first branch (in priority
//! order) that reports the path wins, but the scan never starts above the
//! branch that owns the parent directory: a child cannot live in a more
//! writable branch than its parent unless the parent was promoted first.

use crate::branch::{Attr, Branch};
use crate::cache::{Clock, TimedCache};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::path;

/// Which branch owns a path, with the attributes that branch reported
#[derive(Debug, Clone)]
pub struct BranchResult {
    attr: Option<Attr>,
    branch: Option<usize>,
}

impl BranchResult {
    pub fn found(branch: usize, attr: Attr) -> Self {
        Self {
            attr: Some(attr),
            branch: Some(branch),
        }
    }

    pub fn not_found() -> Self {
        Self {
            attr: None,
            branch: None,
        }
    }

    /// Owning branch index, `None` when no branch has the path
    pub fn branch(&self) -> Option<usize> {
        self.branch
    }

    pub fn attr(&self) -> Option<&Attr> {
        self.attr.as_ref()
    }

    pub fn attr_mut(&mut self) -> Option<&mut Attr> {
        self.attr.as_mut()
    }

    /// The attributes, or `NotFound`
    pub fn status(&self) -> Result<&Attr> {
        self.attr.as_ref().ok_or(Error::NotFound)
    }

    pub fn is_found(&self) -> bool {
        self.branch.is_some()
    }

    /// Lives in a read-only branch
    pub fn is_lower(&self) -> bool {
        matches!(self.branch, Some(b) if b > 0)
    }

    pub fn is_dir(&self) -> bool {
        self.attr.as_ref().is_some_and(Attr::is_dir)
    }

    /// Same attributes, owned by another branch
    pub fn with_branch(mut self, branch: usize) -> Self {
        if self.attr.is_some() {
            self.branch = Some(branch);
        }
        self
    }
}

/// Cached path → branch resolution
pub struct BranchResolver {
    branches: Vec<Arc<dyn Branch>>,
    cache: TimedCache<String, BranchResult>,
}

impl BranchResolver {
    pub fn new(branches: Vec<Arc<dyn Branch>>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            branches,
            cache: TimedCache::with_clock(ttl, clock),
        }
    }

    pub fn branches(&self) -> &[Arc<dyn Branch>] {
        &self.branches
    }

    pub fn resolve(&self, path: &str) -> BranchResult {
        self.cache
            .get(&path.to_string(), |p| (self.resolve_uncached(p), true))
    }

    /// Resolve against the branches, replacing any cached result
    pub fn resolve_fresh(&self, path: &str) -> BranchResult {
        self.cache
            .get_fresh(&path.to_string(), |p| (self.resolve_uncached(p), true))
    }

    fn resolve_uncached(&self, path: &str) -> BranchResult {
        let first = if path.is_empty() {
            0
        } else {
            match self.resolve(path::parent(path)).branch() {
                Some(branch) => branch,
                None => return BranchResult::not_found(),
            }
        };

        for (index, branch) in self.branches.iter().enumerate().skip(first) {
            match branch.get_attr(path) {
                Ok(mut attr) => {
                    if index > 0 {
                        attr.ino = 0;
                    }
                    return BranchResult::found(index, attr);
                }
                Err(Error::NotFound) | Err(Error::NotADirectory) => {}
                Err(e) => warn!("getattr {:?}: got error {} from branch {}", path, e, index),
            }
        }
        BranchResult::not_found()
    }

    pub fn set(&self, path: &str, result: BranchResult) {
        self.cache.set(path.to_string(), result);
    }

    pub fn invalidate(&self, path: &str) {
        self.cache.drop_entry(&path.to_string());
    }

    /// Drop the given paths, or every cached resolution
    pub fn drop_all(&self, paths: Option<&[String]>) {
        self.cache.drop_all(paths);
    }

    pub fn purge(&self) -> usize {
        self.cache.purge()
    }
}
