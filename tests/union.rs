//! End-to-end behaviour of the union over real directories

use branchfs::branch::{Branch, LocalBranch, RemoteBranch};
use branchfs::cache::{load_markers, Clock, ManualClock};
use branchfs::config::{BranchConfig, Config, DEFAULT_DELETION_DIR};
use branchfs::union::{deleted_paths, marker_name, UnionFs};
use branchfs::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::runtime::Runtime;

fn local(root: &Path) -> Arc<dyn Branch> {
    Arc::new(LocalBranch::new(root.to_path_buf()).unwrap())
}

struct Union {
    rw: TempDir,
    ro: TempDir,
    clock: Arc<ManualClock>,
    fs: Arc<UnionFs>,
    _rt: Runtime,
}

impl Union {
    fn new() -> Self {
        Self::with_lower(|root, _| local(root))
    }

    fn with_lower<F>(lower: F) -> Self
    where
        F: FnOnce(&Path, Arc<dyn Clock>) -> Arc<dyn Branch>,
    {
        let rw = tempdir().unwrap();
        let ro = tempdir().unwrap();
        let rt = Runtime::new().unwrap();
        let clock = Arc::new(ManualClock::new());

        let config = Config::with_branches(vec![
            BranchConfig::local(rw.path()),
            BranchConfig::local(ro.path()),
        ]);
        let branches = vec![local(rw.path()), lower(ro.path(), clock.clone())];
        let fs = UnionFs::new(branches, &config, clock.clone(), rt.handle().clone()).unwrap();

        Self {
            rw,
            ro,
            clock,
            fs,
            _rt: rt,
        }
    }

    fn lower(&self, path: &str, content: &[u8]) {
        let full = self.ro.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
    }

    fn list(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .fs
            .list_dir(dir)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        names
    }

    fn read_all(&self, path: &str) -> Vec<u8> {
        let fh = self.fs.open(path, libc::O_RDONLY).unwrap();
        let data = self.fs.read(fh, 0, 1 << 16).unwrap();
        self.fs.release(fh).unwrap();
        data
    }

    fn marker_exists(&self, path: &str) -> bool {
        self.rw
            .path()
            .join(DEFAULT_DELETION_DIR)
            .join(marker_name(path))
            .exists()
    }
}

#[test]
fn upper_entry_shadows_lower() {
    let u = Union::new();
    u.lower("shared", b"lower");
    fs::write(u.rw.path().join("shared"), b"upper").unwrap();
    u.lower("only-lower", b"x");

    assert_eq!(u.list(""), vec!["only-lower", "shared"]);
    assert_eq!(u.fs.resolve("shared").branch(), Some(0));
    assert_eq!(u.fs.resolve("only-lower").branch(), Some(1));
    assert_eq!(u.read_all("shared"), b"upper");
}

#[test]
fn lower_inode_numbers_are_zeroed() {
    let u = Union::new();
    u.lower("f", b"x");
    fs::write(u.rw.path().join("g"), b"x").unwrap();

    assert_eq!(u.fs.resolve("f").attr().unwrap().ino, 0);
    assert_ne!(u.fs.resolve("g").attr().unwrap().ino, 0);
}

#[test]
fn unlink_then_create_round_trip() {
    let u = Union::new();
    u.lower("a.txt", b"hi");
    assert_eq!(u.list(""), vec!["a.txt"]);

    u.fs.unlink("a.txt").unwrap();
    assert!(u.list("").is_empty());
    assert!(!u.fs.resolve("a.txt").is_found());
    assert!(u.fs.get_attr("a.txt").unwrap_err().is_not_found());
    assert!(u.marker_exists("a.txt"));
    assert_eq!(fs::read(u.ro.path().join("a.txt")).unwrap(), b"hi");

    let (fh, attr) = u.fs.create("a.txt", libc::O_RDWR | libc::O_CREAT, 0o644).unwrap();
    assert!(attr.is_file());
    assert_eq!(u.fs.write(fh, 0, b"bye").unwrap(), 3);
    u.fs.flush(fh).unwrap();
    u.fs.release(fh).unwrap();

    assert_eq!(u.fs.resolve("a.txt").branch(), Some(0));
    assert_eq!(u.read_all("a.txt"), b"bye");
    assert!(!u.marker_exists("a.txt"));
    assert_eq!(u.list(""), vec!["a.txt"]);
}

#[test]
fn unlink_of_shadowing_entry_hides_lower_copy() {
    let u = Union::new();
    u.lower("s", b"lower");
    fs::write(u.rw.path().join("s"), b"upper").unwrap();

    u.fs.unlink("s").unwrap();
    assert!(!u.rw.path().join("s").exists());
    assert!(u.marker_exists("s"));
    assert!(!u.fs.resolve("s").is_found());
    assert!(u.list("").is_empty());
}

#[test]
fn unlink_of_upper_only_entry_leaves_no_marker() {
    let u = Union::new();
    fs::write(u.rw.path().join("mine"), b"x").unwrap();

    u.fs.unlink("mine").unwrap();
    assert!(!u.marker_exists("mine"));
    assert!(matches!(u.fs.unlink("mine"), Err(Error::NotFound)));
}

#[test]
fn promotion_happens_once() {
    let u = Union::new();
    u.lower("dir/f", b"lower");

    let fh = u.fs.open("dir/f", libc::O_WRONLY).unwrap();
    u.fs.write(fh, 0, b"UP").unwrap();
    u.fs.release(fh).unwrap();

    // A second write-open must not copy the lower content over the upper one.
    let fh = u.fs.open("dir/f", libc::O_RDWR).unwrap();
    assert_eq!(u.fs.read(fh, 0, 16).unwrap(), b"UPwer");
    u.fs.release(fh).unwrap();

    assert_eq!(fs::read(u.rw.path().join("dir/f")).unwrap(), b"UPwer");
    assert_eq!(fs::read(u.ro.path().join("dir/f")).unwrap(), b"lower");
    assert_eq!(u.fs.resolve("dir").branch(), Some(0));
}

#[test]
fn rename_file_from_lower_branch() {
    let u = Union::new();
    u.lower("p", b"payload");

    u.fs.rename("p", "q").unwrap();

    assert!(!u.fs.resolve("p").is_found());
    assert_eq!(u.fs.resolve("q").branch(), Some(0));
    assert!(u.marker_exists("p"));
    assert_eq!(fs::read(u.rw.path().join("q")).unwrap(), b"payload");
    assert_eq!(u.list(""), vec!["q"]);
}

#[test]
fn rename_over_deleted_name_clears_its_marker() {
    let u = Union::new();
    u.lower("old", b"x");
    u.lower("new", b"y");

    u.fs.unlink("new").unwrap();
    assert!(u.marker_exists("new"));

    u.fs.rename("old", "new").unwrap();
    assert!(!u.marker_exists("new"));
    assert_eq!(u.read_all("new"), b"x");
    assert_eq!(u.list(""), vec!["new"]);
}

#[test]
fn rename_directory_from_lower_branch() {
    let u = Union::new();
    u.lower("src/a", b"a");
    u.lower("src/sub/b", b"b");

    u.fs.rename("src", "dst").unwrap();

    assert_eq!(u.list(""), vec!["dst"]);
    assert_eq!(u.list("dst"), vec!["a", "sub"]);
    assert_eq!(u.fs.resolve("dst/sub/b").branch(), Some(0));
    assert_eq!(u.read_all("dst/sub/b"), b"b");
    assert!(!u.fs.resolve("src").is_found());
    assert!(u.marker_exists("src"));
    assert!(u.ro.path().join("src/sub/b").exists());
}

#[test]
fn open_handle_follows_rename() {
    let u = Union::new();
    fs::write(u.rw.path().join("f"), b"x").unwrap();

    let fh = u.fs.open("f", libc::O_RDWR).unwrap();
    u.fs.rename("f", "g").unwrap();
    u.fs.write(fh, 1, b"y").unwrap();
    u.fs.flush(fh).unwrap();
    u.fs.release(fh).unwrap();

    assert_eq!(u.read_all("g"), b"xy");
}

#[test]
fn rmdir_refuses_directory_with_lower_children() {
    let u = Union::new();
    u.lower("d/child", b"x");
    fs::create_dir(u.rw.path().join("d")).unwrap();

    assert!(matches!(u.fs.rmdir("d"), Err(Error::DirectoryNotEmpty)));

    u.fs.unlink("d/child").unwrap();
    u.fs.rmdir("d").unwrap();
    assert!(!u.fs.resolve("d").is_found());
    assert!(u.marker_exists("d"));
}

#[test]
fn resolution_expires_after_ttl() {
    let u = Union::new();
    assert!(!u.fs.resolve("late").is_found());

    u.lower("late", b"x");
    assert!(!u.fs.resolve("late").is_found());

    u.clock.advance(Duration::from_secs(4));
    assert!(!u.fs.resolve("late").is_found());

    u.clock.advance(Duration::from_secs(2));
    assert_eq!(u.fs.resolve("late").branch(), Some(1));
}

#[test]
fn deletions_are_listed_by_path() {
    let u = Union::new();
    u.lower("a.txt", b"x");
    u.lower("d/x", b"x");
    u.lower("d/y", b"x");

    u.fs.unlink("a.txt").unwrap();
    u.fs.unlink("d/x").unwrap();

    let rw = LocalBranch::new(u.rw.path().to_path_buf()).unwrap();
    let deleted = deleted_paths(&rw, DEFAULT_DELETION_DIR).unwrap();
    assert_eq!(deleted, vec!["a.txt", "d/x"]);
    assert_eq!(u.list("d"), vec!["y"]);
}

#[test]
fn marker_written_outside_the_union_is_seen_after_drop() {
    let u = Union::new();
    u.lower("gone", b"x");
    assert_eq!(u.list(""), vec!["gone"]);

    fs::write(
        u.rw.path().join(DEFAULT_DELETION_DIR).join(marker_name("gone")),
        b"gone",
    )
    .unwrap();
    u.fs.drop_caches();

    assert!(u.list("").is_empty());
    assert!(!u.fs.resolve("gone").is_found());
}

#[test]
fn remote_lookups_are_cached_until_dropped() {
    let u = Union::with_lower(|root, clock| {
        let remote: Arc<dyn Branch> =
            Arc::new(RemoteBranch::new(local(root), None, Duration::ZERO, clock));
        remote
    });
    u.lower("obj", b"v1");
    assert_eq!(u.fs.get_attr("obj").unwrap().size, 2);

    u.lower("obj", b"version2");
    u.clock.advance(Duration::from_secs(10));
    assert_eq!(u.fs.get_attr("obj").unwrap().size, 2);

    u.fs.drop_caches();
    assert_eq!(u.fs.get_attr("obj").unwrap().size, 8);
}

#[test]
fn remote_branch_is_never_written() {
    let u = Union::with_lower(|root, clock| {
        let endpoint = Some("s3://bucket".to_string());
        let remote: Arc<dyn Branch> =
            Arc::new(RemoteBranch::new(local(root), endpoint, Duration::ZERO, clock));
        remote
    });
    u.lower("doc", b"remote");

    u.fs.chmod("doc", 0o600).unwrap();
    u.fs.unlink("doc").unwrap();

    assert!(!u.fs.resolve("doc").is_found());
    assert!(u.ro.path().join("doc").exists());
    assert!(u.marker_exists("doc"));
}

#[test]
fn remote_lookups_expire_with_the_union_clock() {
    let u = Union::with_lower(|root, clock| {
        let ttl = Duration::from_secs(30);
        let remote: Arc<dyn Branch> = Arc::new(RemoteBranch::new(local(root), None, ttl, clock));
        remote
    });
    u.lower("obj", b"v1");
    assert_eq!(u.fs.get_attr("obj").unwrap().size, 2);

    u.lower("obj", b"version2");
    u.clock.advance(Duration::from_secs(10));
    assert_eq!(u.fs.get_attr("obj").unwrap().size, 2);

    u.clock.advance(Duration::from_secs(20));
    assert_eq!(u.fs.get_attr("obj").unwrap().size, 8);
}

#[test]
fn listing_taken_before_unlink_cannot_resurrect_the_entry() {
    let u = Union::new();
    u.lower("a.txt", b"a");
    u.lower("b.txt", b"b");
    assert_eq!(u.list(""), vec!["a.txt", "b.txt"]);

    let index = u.fs.deletion_index();
    assert!(index.is_warm());
    let generation = index.generation();
    let rw = LocalBranch::new(u.rw.path().to_path_buf()).unwrap();
    let stale = load_markers(&rw, DEFAULT_DELETION_DIR).unwrap();
    assert!(stale.is_empty());

    u.fs.unlink("a.txt").unwrap();
    assert!(!index.populate(stale, generation));

    assert!(u.fs.get_attr("a.txt").unwrap_err().is_not_found());
    assert!(!u.fs.resolve("a.txt").is_found());
    assert_eq!(u.list(""), vec!["b.txt"]);
}

#[test]
fn deleted_entry_cannot_be_reopened_or_renamed() {
    let u = Union::new();
    u.lower("gone", b"x");
    u.lower("dir/inner", b"x");
    u.fs.unlink("gone").unwrap();

    assert!(matches!(u.fs.open("gone", libc::O_RDONLY), Err(Error::NotFound)));
    assert!(matches!(u.fs.rename("gone", "back"), Err(Error::NotFound)));
    assert!(matches!(u.fs.unlink("gone"), Err(Error::NotFound)));
    assert!(!u.rw.path().join("gone").exists());
    assert!(!u.rw.path().join("back").exists());

    assert!(matches!(u.fs.unlink("dir"), Err(Error::IsADirectory)));
    assert_eq!(u.list("dir"), vec!["inner"]);
}

/// A union of one writable and several read-only branches
struct Layers {
    dirs: Vec<TempDir>,
    fs: Arc<UnionFs>,
    _rt: Runtime,
}

impl Layers {
    fn new(count: usize) -> Self {
        let dirs: Vec<TempDir> = (0..count).map(|_| tempdir().unwrap()).collect();
        let rt = Runtime::new().unwrap();
        let config =
            Config::with_branches(dirs.iter().map(|d| BranchConfig::local(d.path())).collect());
        let branches = dirs.iter().map(|d| local(d.path())).collect();
        let fs = UnionFs::new(
            branches,
            &config,
            Arc::new(ManualClock::new()),
            rt.handle().clone(),
        )
        .unwrap();
        Self { dirs, fs, _rt: rt }
    }

    fn put(&self, branch: usize, path: &str, content: &[u8]) {
        let full = self.dirs[branch].path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
    }

    fn list(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> =
            self.fs.list_dir(dir).unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        names
    }

    fn read_all(&self, path: &str) -> Vec<u8> {
        let fh = self.fs.open(path, libc::O_RDONLY).unwrap();
        let data = self.fs.read(fh, 0, 1 << 16).unwrap();
        self.fs.release(fh).unwrap();
        data
    }
}

#[test]
fn lower_branches_keep_their_priority() {
    let l = Layers::new(3);
    l.put(1, "f", b"one");
    l.put(2, "f", b"two");
    l.put(2, "g", b"two");

    assert_eq!(l.fs.resolve("f").branch(), Some(1));
    assert_eq!(l.fs.resolve("g").branch(), Some(2));
    assert_eq!(l.read_all("f"), b"one");
    assert_eq!(l.list(""), vec!["f", "g"]);
}

#[test]
fn listing_merges_all_three_branches() {
    let l = Layers::new(3);
    l.put(0, "d/a", b"zero");
    l.put(1, "d/b", b"one");
    l.put(2, "d/c", b"two");
    l.put(1, "d/s", b"one");
    l.put(2, "d/s", b"two");

    assert_eq!(l.list("d"), vec!["a", "b", "c", "s"]);
    assert_eq!(l.fs.resolve("d/s").branch(), Some(1));
    assert_eq!(l.fs.resolve("d/c").branch(), Some(2));
    assert_eq!(l.read_all("d/s"), b"one");
}

#[test]
fn child_lookup_starts_at_parent_branch() {
    let l = Layers::new(3);
    l.put(2, "deep/f", b"two");
    assert_eq!(l.fs.resolve("deep").branch(), Some(2));

    // A copy appearing above while the parent's resolution is cached is not seen.
    l.put(1, "deep/f", b"one");
    assert_eq!(l.fs.resolve("deep/f").branch(), Some(2));
    assert_eq!(l.read_all("deep/f"), b"two");
    assert_eq!(l.list("deep"), vec!["f"]);
}

#[test]
fn one_marker_hides_every_lower_copy() {
    let l = Layers::new(3);
    l.put(1, "x", b"one");
    l.put(2, "x", b"two");
    l.put(2, "y", b"two");

    l.fs.unlink("x").unwrap();
    assert_eq!(l.list(""), vec!["y"]);
    assert!(!l.fs.resolve("x").is_found());
    assert!(l.dirs[1].path().join("x").exists());
    assert!(l.dirs[2].path().join("x").exists());
    let marker = l.dirs[0].path().join(DEFAULT_DELETION_DIR).join(marker_name("x"));
    assert!(marker.exists());

    let (fh, _) = l.fs.create("x", libc::O_RDWR | libc::O_CREAT, 0o644).unwrap();
    l.fs.release(fh).unwrap();
    assert_eq!(l.fs.resolve("x").branch(), Some(0));
    assert!(!marker.exists());
}

#[test]
fn rename_from_third_branch() {
    let l = Layers::new(3);
    l.put(2, "d/f", b"two");

    l.fs.rename("d/f", "d/g").unwrap();

    assert_eq!(fs::read(l.dirs[0].path().join("d/g")).unwrap(), b"two");
    assert!(!l.fs.resolve("d/f").is_found());
    assert_eq!(l.list("d"), vec!["g"]);
    assert!(l.dirs[2].path().join("d/f").exists());
}
