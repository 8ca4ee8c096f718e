//! Configuration management for branchfs

use crate::branch::DROP_CACHE_NAME;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default name of the marker directory on the writable branch
pub const DEFAULT_DELETION_DIR: &str = ".branchfs_deletions";

/// Default branch resolution cache TTL in seconds
pub const DEFAULT_BRANCH_TTL_SECS: f64 = 5.0;

/// Default deletion index TTL in seconds
pub const DEFAULT_DELETION_TTL_SECS: f64 = 5.0;

/// Default kernel entry/attribute TTL in seconds
pub const DEFAULT_ENTRY_TTL_SECS: f64 = 1.0;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Branches in priority order; the first one is the writable branch
    pub branches: Vec<BranchConfig>,

    /// Name of the marker directory at the root of the writable branch
    #[serde(default = "default_deletion_dir")]
    pub deletion_dir: String,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Mount configuration
    #[serde(default)]
    pub mount: MountConfig,
}

/// Kind of backend behind a branch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BranchKind {
    /// Directory on local disk
    Local,
    /// Local mirror of a remote object store, read-only with cached lookups
    Remote,
}

/// One branch of the union
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    pub kind: BranchKind,

    /// Directory holding the branch contents
    pub root: PathBuf,

    /// Object store address for remote branches
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl BranchConfig {
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            kind: BranchKind::Local,
            root: root.into(),
            endpoint: None,
        }
    }

    pub fn remote(root: impl Into<PathBuf>, endpoint: Option<String>) -> Self {
        Self {
            kind: BranchKind::Remote,
            root: root.into(),
            endpoint,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a branch resolution stays valid
    pub branch_ttl_secs: f64,

    /// How long a populated deletion index stays valid
    pub deletion_ttl_secs: f64,

    /// How long remote branch lookups stay valid (0 = until dropped)
    pub remote_ttl_secs: f64,

    /// Kernel entry and attribute timeout
    pub entry_ttl_secs: f64,

    /// Kernel negative lookup timeout
    pub negative_ttl_secs: f64,

    /// Interval of the expired-entry sweep (0 = disabled)
    pub purge_interval_secs: f64,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Log every FUSE request
    pub debug: bool,
}

fn default_deletion_dir() -> String {
    DEFAULT_DELETION_DIR.to_string()
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            branch_ttl_secs: DEFAULT_BRANCH_TTL_SECS,
            deletion_ttl_secs: DEFAULT_DELETION_TTL_SECS,
            remote_ttl_secs: 0.0,
            entry_ttl_secs: DEFAULT_ENTRY_TTL_SECS,
            negative_ttl_secs: DEFAULT_ENTRY_TTL_SECS,
            purge_interval_secs: 60.0,
        }
    }
}

impl CacheConfig {
    pub fn branch_ttl(&self) -> Duration {
        secs(self.branch_ttl_secs)
    }

    pub fn deletion_ttl(&self) -> Duration {
        secs(self.deletion_ttl_secs)
    }

    pub fn remote_ttl(&self) -> Duration {
        secs(self.remote_ttl_secs)
    }

    pub fn entry_ttl(&self) -> Duration {
        secs(self.entry_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        secs(self.negative_ttl_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        secs(self.purge_interval_secs)
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/branchfs"),
            allow_other: false,
            fs_name: "branchfs".to_string(),
            debug: false,
        }
    }
}

impl Config {
    /// Configuration for the given branches with every other setting at its default
    pub fn with_branches(branches: Vec<BranchConfig>) -> Self {
        Config {
            branches,
            deletion_dir: default_deletion_dir(),
            cache: CacheConfig::default(),
            mount: MountConfig::default(),
        }
    }

    /// Load and validate configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from a file and apply environment overrides,
    /// without validating it
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("BRANCHFS_DELETION_DIR") {
            let dir = dir.trim().to_string();
            if !dir.is_empty() {
                self.deletion_dir = dir;
            }
        }

        let ttl_overrides: [(&str, &mut f64); 3] = [
            ("BRANCHFS_BRANCH_TTL", &mut self.cache.branch_ttl_secs),
            ("BRANCHFS_DELETION_TTL", &mut self.cache.deletion_ttl_secs),
            ("BRANCHFS_REMOTE_TTL", &mut self.cache.remote_ttl_secs),
        ];
        for (var, target) in ttl_overrides {
            if let Ok(value) = std::env::var(var) {
                if let Ok(secs) = value.trim().parse::<f64>() {
                    *target = secs;
                }
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let writable = self.branches.first().ok_or_else(|| {
            Error::InvalidConfig("At least one branch is required".to_string())
        })?;

        if writable.kind != BranchKind::Local {
            return Err(Error::InvalidConfig(
                "The first (writable) branch must be a local branch".to_string(),
            ));
        }

        if self.deletion_dir.is_empty()
            || self.deletion_dir.contains('/')
            || self.deletion_dir == "."
            || self.deletion_dir == ".."
            || self.deletion_dir == DROP_CACHE_NAME
        {
            return Err(Error::InvalidConfig(format!(
                "Invalid deletion directory name: {:?}",
                self.deletion_dir
            )));
        }

        for (secs, name) in [
            (self.cache.branch_ttl_secs, "branch_ttl_secs"),
            (self.cache.deletion_ttl_secs, "deletion_ttl_secs"),
            (self.cache.remote_ttl_secs, "remote_ttl_secs"),
            (self.cache.entry_ttl_secs, "entry_ttl_secs"),
            (self.cache.negative_ttl_secs, "negative_ttl_secs"),
            (self.cache.purge_interval_secs, "purge_interval_secs"),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(Error::InvalidConfig(format!("{} must be >= 0", name)));
            }
        }

        for branch in &self.branches {
            if !branch.root.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "Branch root {:?} is not a directory",
                    branch.root
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::with_branches(vec![]);
        assert_eq!(config.deletion_dir, DEFAULT_DELETION_DIR);
        assert_eq!(config.cache.branch_ttl(), Duration::from_secs(5));
        assert_eq!(config.cache.remote_ttl(), Duration::ZERO);
    }

    #[test]
    fn test_validate() {
        let rw = tempdir().unwrap();
        let ro = tempdir().unwrap();

        assert!(Config::with_branches(vec![]).validate().is_err());

        let remote_first = Config::with_branches(vec![BranchConfig::remote(rw.path(), None)]);
        assert!(remote_first.validate().is_err());

        let mut config = Config::with_branches(vec![
            BranchConfig::local(rw.path()),
            BranchConfig::remote(ro.path(), Some("objects:7000".into())),
        ]);
        assert!(config.validate().is_ok());

        config.deletion_dir = "a/b".into();
        assert!(config.validate().is_err());
        config.deletion_dir = DROP_CACHE_NAME.into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_root_fails_validation() {
        let rw = tempdir().unwrap();
        let config = Config::with_branches(vec![
            BranchConfig::local(rw.path()),
            BranchConfig::local(rw.path().join("missing")),
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let rw = tempdir().unwrap();
        let path = rw.path().join("config.json");

        let mut config = Config::with_branches(vec![BranchConfig::local(rw.path())]);
        config.cache.branch_ttl_secs = 2.5;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.branches.len(), 1);
        assert_eq!(loaded.branches[0].kind, BranchKind::Local);
        assert_eq!(loaded.cache.branch_ttl(), Duration::from_millis(2500));
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let rw = tempdir().unwrap();
        let path = rw.path().join("config.json");
        let json = format!(
            r#"{{"branches": [{{"kind": "local", "root": {:?}}}]}}"#,
            rw.path()
        );
        std::fs::write(&path, json).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.mount.fs_name, "branchfs");
        assert_eq!(config.cache.entry_ttl(), Duration::from_secs(1));
    }
}
