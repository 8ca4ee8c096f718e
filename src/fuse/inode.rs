//! Inode numbers for union paths
//!
//! The kernel addresses everything by inode number while the union works on
//! paths. Numbers are handed out on first lookup and stay attached to a path
//! (following renames) until the kernel forgets them.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::union::path;

/// Inode number of the union root
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

#[derive(Debug, Clone)]
struct InodeEntry {
    path: String,
    /// Outstanding kernel lookups
    lookups: u64,
    /// The path was removed or replaced; only the kernel's reference remains
    detached: bool,
}

#[derive(Default)]
struct Tables {
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<String, u64>,
}

impl Tables {
    fn insert(&mut self, ino: u64, path: String, lookups: u64) {
        self.by_path.insert(path.clone(), ino);
        self.by_ino.insert(
            ino,
            InodeEntry {
                path,
                lookups,
                detached: false,
            },
        );
    }

    /// Unhook `path`; an inode the kernel holds no reference to goes away
    fn detach(&mut self, path: &str) {
        let Some(ino) = self.by_path.remove(path) else {
            return;
        };
        match self.by_ino.get_mut(&ino) {
            Some(entry) if entry.lookups > 0 => entry.detached = true,
            Some(_) => {
                self.by_ino.remove(&ino);
            }
            None => {}
        }
    }

    fn remove(&mut self, ino: u64) -> Option<InodeEntry> {
        let entry = self.by_ino.remove(&ino)?;
        if !entry.detached && self.by_path.get(&entry.path) == Some(&ino) {
            self.by_path.remove(&entry.path);
        }
        Some(entry)
    }
}

/// Bidirectional inode ↔ path map
pub struct InodeTable {
    next_ino: AtomicU64,
    tables: RwLock<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut tables = Tables::default();
        tables.insert(ROOT_INO, String::new(), 1);
        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            tables: RwLock::new(tables),
        }
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    pub fn path(&self, ino: u64) -> Option<String> {
        self.tables
            .read()
            .by_ino
            .get(&ino)
            .filter(|e| !e.detached)
            .map(|e| e.path.clone())
    }

    pub fn get_by_path(&self, path: &str) -> Option<u64> {
        self.tables.read().by_path.get(path).copied()
    }

    /// Inode for a path the kernel is being told about; counts one lookup
    pub fn lookup(&self, path: &str) -> u64 {
        self.register(path, 1)
    }

    /// Inode for a path without counting a lookup (directory listings)
    pub fn peek_or_assign(&self, path: &str) -> u64 {
        self.register(path, 0)
    }

    fn register(&self, path: &str, lookups: u64) -> u64 {
        let mut tables = self.tables.write();
        if let Some(&ino) = tables.by_path.get(path) {
            if let Some(entry) = tables.by_ino.get_mut(&ino) {
                entry.lookups += lookups;
            }
            return ino;
        }
        let ino = self.alloc_ino();
        tables.insert(ino, path.to_string(), lookups);
        ino
    }

    /// Drop `nlookup` kernel references; the inode goes away at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut tables = self.tables.write();
        let remaining = match tables.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups
            }
            None => return,
        };
        if remaining == 0 {
            tables.remove(ino);
        }
    }

    /// Drop those of `inos` the kernel never looked up
    pub fn release_unreferenced(&self, inos: &[u64]) -> usize {
        let mut tables = self.tables.write();
        let mut released = 0;
        for &ino in inos {
            let unreferenced = tables.by_ino.get(&ino).is_some_and(|e| e.lookups == 0);
            if ino != ROOT_INO && unreferenced {
                tables.remove(ino);
                released += 1;
            }
        }
        released
    }

    /// Detach `path` from its inode after it was removed
    pub fn unlink_path(&self, path: &str) {
        self.tables.write().detach(path);
    }

    /// Move every inode at or below `from` to the same place under `to`
    pub fn rename(&self, from: &str, to: &str) {
        let mut tables = self.tables.write();
        tables.detach(to);

        let moved: Vec<(u64, String)> = tables
            .by_ino
            .iter()
            .filter(|(_, e)| !e.detached)
            .filter_map(|(&ino, e)| path::rebase(&e.path, from, to).map(|p| (ino, p)))
            .collect();
        for (ino, new_path) in moved {
            if let Some(entry) = tables.by_ino.get_mut(&ino) {
                let old = std::mem::replace(&mut entry.path, new_path.clone());
                tables.by_path.remove(&old);
                tables.by_path.insert(new_path, ino);
            }
        }
    }

    /// Keep only inodes whose path satisfies `keep`; the root always stays
    pub fn retain<F: FnMut(&str) -> bool>(&self, mut keep: F) -> usize {
        let mut tables = self.tables.write();
        let doomed: Vec<u64> = tables
            .by_ino
            .iter()
            .filter(|(&ino, e)| ino != ROOT_INO && (e.detached || !keep(&e.path)))
            .map(|(&ino, _)| ino)
            .collect();
        for ino in &doomed {
            tables.remove(*ino);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
