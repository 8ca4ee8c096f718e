//! Helpers for union paths
//!
//! Union paths are relative, `/`-separated, without leading or trailing
//! separators; the root is the empty string.

/// Strip leading and trailing separators
pub fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

/// Split into (parent, base name). The parent of a top-level entry is the root.
pub fn split(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, base)) => (parent, base),
        None => ("", path),
    }
}

pub fn parent(path: &str) -> &str {
    split(path).0
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Every proper ancestor of `path`, nearest first, excluding the root
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(parent(path)), |dir| Some(parent(dir)))
        .take_while(|dir| !dir.is_empty())
}

/// Rebase `path` from under `from` to under `to`, if it lies in that subtree
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    let rest = path.strip_prefix(from)?.strip_prefix('/')?;
    Some(join(to, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split() {
        assert_eq!(split("a/b/c"), ("a/b", "c"));
        assert_eq!(split("c"), ("", "c"));
        assert_eq!(split(""), ("", ""));
    }

    #[test]
    fn test_normalize_and_join() {
        assert_eq!(normalize("/a/b/"), "a/b");
        assert_eq!(join("", "x"), "x");
        assert_eq!(join("a/b", "x"), "a/b/x");
    }

    #[test]
    fn test_ancestors() {
        let found: Vec<&str> = ancestors("a/b/c/d").collect();
        assert_eq!(found, vec!["a/b/c", "a/b", "a"]);
        assert_eq!(ancestors("top").count(), 0);
    }

    #[test]
    fn test_rebase() {
        assert_eq!(rebase("src/x/y", "src", "dst").as_deref(), Some("dst/x/y"));
        assert_eq!(rebase("src", "src", "dst").as_deref(), Some("dst"));
        assert_eq!(rebase("srcfoo", "src", "dst"), None);
    }
}
