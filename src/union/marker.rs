//! Deletion markers
//!
//! Deleting something that lives in a read-only branch leaves a marker file
//! in the marker directory of the writable branch. The marker name is derived
//! from the path (hash of the parent directory plus the base name) and the
//! marker content is the full path, so deletions can be listed back.

use crate::branch::Branch;
use crate::cache::{load_markers, DeletionIndex};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use super::path;

/// Marker file name for `path`
pub fn marker_name(path: &str) -> String {
    let (parent, base) = path::split(path);
    let dir = if parent.is_empty() {
        String::new()
    } else {
        format!("{}/", parent)
    };
    let digest = blake3::hash(dir.as_bytes());
    format!("{}-{}", hex::encode(&digest.as_bytes()[..8]), base)
}

/// Read back every deleted path recorded in `dir`
pub fn deleted_paths(branch: &dyn Branch, dir: &str) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for name in load_markers(branch, dir)? {
        let marker = path::join(dir, &name);
        let size = branch.get_attr(&marker)?.size;
        let content = branch
            .open(&marker, libc::O_RDONLY)?
            .read_at(0, size as u32)?;
        match String::from_utf8(content) {
            Ok(path) => paths.push(path),
            Err(_) => warn!("marker {:?} does not hold a valid path", marker),
        }
    }
    paths.sort();
    Ok(paths)
}

/// Marker files on the writable branch, with their index
pub struct Markers {
    branch: Arc<dyn Branch>,
    dir: String,
    index: DeletionIndex,
}

impl Markers {
    pub fn new(branch: Arc<dyn Branch>, index: DeletionIndex) -> Self {
        Self {
            branch,
            dir: index.dir().to_string(),
            index,
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn index(&self) -> &DeletionIndex {
        &self.index
    }

    fn marker_path(&self, path: &str) -> String {
        path::join(&self.dir, &marker_name(path))
    }

    /// Create the marker directory if needed
    pub fn ensure_dir(&self) -> Result<()> {
        let attr = match self.branch.get_attr(&self.dir) {
            Err(Error::NotFound) => self
                .branch
                .mkdir(&self.dir, 0o755)
                .and_then(|_| self.branch.get_attr(&self.dir)),
            other => other,
        };
        match attr {
            Ok(attr) if attr.is_dir() => Ok(()),
            Ok(_) => {
                warn!("{:?} on {} is not a directory", self.dir, self.branch);
                Err(Error::ReadOnlyFilesystem)
            }
            Err(e) => {
                warn!("cannot create marker directory {:?}: {}", self.dir, e);
                Err(Error::ReadOnlyFilesystem)
            }
        }
    }

    /// Record `path` as deleted
    pub fn mark_deleted(&self, path: &str) -> Result<()> {
        self.ensure_dir()?;

        let marker = self.marker_path(path);
        let existing = self.branch.get_attr(&marker);
        if let Ok(attr) = &existing {
            if attr.size == path.len() as u64 {
                self.index.add_entry(&marker_name(path));
                return Ok(());
            }
        }

        let flags = libc::O_WRONLY | libc::O_TRUNC;
        let file = match existing {
            Err(Error::NotFound) => self.branch.create(&marker, flags, 0o644),
            _ => {
                if let Err(e) = self.branch.chmod(&marker, 0o644) {
                    debug!("chmod {:?}: {}", marker, e);
                }
                self.branch.open(&marker, flags)
            }
        }
        .map_err(|e| {
            warn!("could not create deletion marker {:?}: {}", marker, e);
            Error::PermissionDenied
        })?;

        let written = file.write_at(0, path.as_bytes())?;
        if written as usize != path.len() {
            panic!(
                "short write of deletion marker {:?} for {:?}: {} of {} bytes",
                marker,
                path,
                written,
                path.len()
            );
        }
        file.flush()?;
        // The index learns about the marker only once it is on disk, so a
        // refresh started here cannot miss it.
        self.index.add_entry(&marker_name(path));
        debug!("marked {:?} deleted", path);
        Ok(())
    }

    /// Forget a deletion of `path`, if there was one
    pub fn unmark_deleted(&self, path: &str) {
        let marker = self.marker_path(path);
        match self.branch.unlink(&marker) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(e) => warn!("error unlinking {:?}: {}", marker, e),
        }
        self.index.remove_entry(&marker_name(path));
    }

    pub fn is_deleted(&self, path: &str) -> Result<bool> {
        let state = self.index.has_entry(&marker_name(path));
        if state.known {
            return Ok(state.deleted);
        }

        let marker = self.marker_path(path);
        match self.branch.get_attr(&marker) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => {
                warn!("error accessing deletion marker {:?}: {}", marker, e);
                Err(Error::ReadOnlyFilesystem)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::LocalBranch;
    use crate::cache::ManualClock;
    use std::fs;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::runtime::Runtime;

    fn markers(rt: &Runtime) -> (TempDir, Markers) {
        let dir = tempdir().unwrap();
        let branch: Arc<dyn Branch> =
            Arc::new(LocalBranch::new(dir.path().to_path_buf()).unwrap());
        let index = DeletionIndex::new(
            Arc::clone(&branch),
            ".deleted",
            Duration::from_secs(5),
            Arc::new(ManualClock::new()),
            rt.handle().clone(),
        );
        (dir, Markers::new(branch, index))
    }

    #[test]
    fn test_marker_name() {
        let top = marker_name("a.txt");
        let nested = marker_name("dir/a.txt");
        assert!(top.ends_with("-a.txt"));
        assert_eq!(top.len(), 16 + 1 + "a.txt".len());
        assert_ne!(top, nested);
        assert_eq!(nested, marker_name("dir/a.txt"));
        assert_ne!(marker_name("dir/b.txt"), nested);
        assert_eq!(&marker_name("dir/b.txt")[..16], &nested[..16]);
    }

    #[test]
    fn test_mark_and_unmark() {
        let rt = Runtime::new().unwrap();
        let (dir, markers) = markers(&rt);

        assert!(!markers.is_deleted("dir/a.txt").unwrap());
        markers.mark_deleted("dir/a.txt").unwrap();
        assert!(markers.is_deleted("dir/a.txt").unwrap());

        let on_disk = dir.path().join(".deleted").join(marker_name("dir/a.txt"));
        assert_eq!(fs::read_to_string(&on_disk).unwrap(), "dir/a.txt");

        // Marking twice leaves one marker with the same content.
        markers.mark_deleted("dir/a.txt").unwrap();
        assert_eq!(fs::read_dir(dir.path().join(".deleted")).unwrap().count(), 1);

        markers.unmark_deleted("dir/a.txt");
        assert!(!on_disk.exists());
        assert!(!markers.is_deleted("dir/a.txt").unwrap());

        // Unmarking something never marked is fine.
        markers.unmark_deleted("never");
    }

    #[test]
    fn test_marker_dir_blocked_by_file() {
        let rt = Runtime::new().unwrap();
        let (dir, markers) = markers(&rt);
        fs::write(dir.path().join(".deleted"), b"not a dir").unwrap();
        assert!(matches!(
            markers.mark_deleted("x"),
            Err(Error::ReadOnlyFilesystem)
        ));
    }

    #[test]
    fn test_deleted_paths() {
        let rt = Runtime::new().unwrap();
        let (dir, markers) = markers(&rt);
        markers.mark_deleted("b/c").unwrap();
        markers.mark_deleted("a").unwrap();

        let branch = LocalBranch::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(deleted_paths(&branch, ".deleted").unwrap(), vec!["a", "b/c"]);
        assert!(deleted_paths(&branch, ".missing").unwrap().is_empty());
    }
}
