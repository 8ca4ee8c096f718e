//! branchfs - Union filesystem over local and remote branches
//!
//! Usage:
//!   branchfs mount <mount_point> <rw_dir> [ro_dir...]  - Mount a union
//!   branchfs unmount <mount_point>                      - Unmount it
//!   branchfs drop-cache <mount_point>                   - Drop all caches of a mount
//!   branchfs deletions <rw_dir>                         - List deleted paths

use branchfs::{
    branch::{open_branches, LocalBranch, DROP_CACHE_NAME},
    cache::{Clock, MonotonicClock},
    config::{BranchConfig, Config, DEFAULT_DELETION_DIR},
    fuse::FuseAdapter,
    union::{deleted_paths, UnionFs},
    Error, Result,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "branchfs")]
#[command(version)]
#[command(about = "Union filesystem with copy-up over local and remote branches")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a union of branches
    Mount {
        /// Mount point directory
        mount_point: PathBuf,

        /// Writable branch
        rw_dir: Option<PathBuf>,

        /// Read-only branches, highest priority first
        ro_dirs: Vec<PathBuf>,

        /// Read-only remote mirror branches, after the local ones
        #[arg(long = "remote")]
        remote_dirs: Vec<PathBuf>,

        /// Configuration file (branches given on the command line are appended)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Name of the deletion marker directory
        #[arg(long)]
        deletion_dir: Option<String>,

        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Drop every cache of a mounted union
    DropCache {
        /// Mount point of the union
        mount_point: PathBuf,
    },

    /// List the paths recorded as deleted in a writable branch
    Deletions {
        /// Writable branch directory
        rw_dir: PathBuf,

        /// Name of the deletion marker directory
        #[arg(long, default_value = DEFAULT_DELETION_DIR)]
        deletion_dir: String,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { "debug" } else { "info" };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    if let Err(e) = run_command(cli.command) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Mount {
            mount_point,
            rw_dir,
            ro_dirs,
            remote_dirs,
            config,
            deletion_dir,
            foreground,
            allow_other,
        } => {
            let mut config = match config {
                Some(path) => Config::from_file(expand_tilde(&path))?,
                None => {
                    let mut config = Config::with_branches(Vec::new());
                    config.apply_env_overrides();
                    config
                }
            };
            config.branches.extend(rw_dir.into_iter().map(BranchConfig::local));
            config.branches.extend(ro_dirs.into_iter().map(BranchConfig::local));
            config
                .branches
                .extend(remote_dirs.into_iter().map(|dir| BranchConfig::remote(dir, None)));
            if let Some(dir) = deletion_dir {
                config.deletion_dir = dir;
            }
            config.mount.mount_point = mount_point;
            config.mount.allow_other |= allow_other;
            config.validate()?;
            cmd_mount(config, foreground)
        }

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::DropCache { mount_point } => cmd_drop_cache(&mount_point),

        Commands::Deletions {
            rw_dir,
            deletion_dir,
        } => cmd_deletions(rw_dir, &deletion_dir),
    }
}

fn cmd_mount(config: Config, foreground: bool) -> Result<()> {
    info!("Starting branchfs...");

    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
    let branches = open_branches(&config, Arc::clone(&clock))?;
    let union = UnionFs::new(branches, &config, clock, runtime.handle().clone())?;
    let fs = FuseAdapter::new(union, &config.cache);

    let mount_point = &config.mount.mount_point;
    std::fs::create_dir_all(mount_point)?;

    info!("Mounting at {:?}", mount_point);

    // Build mount options
    let mut options = vec![
        fuser::MountOption::FSName(config.mount.fs_name.clone()),
        fuser::MountOption::RW,
    ];

    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
        options.push(fuser::MountOption::AutoUnmount);
    }

    if !foreground {
        info!("Use 'branchfs unmount {:?}' to unmount", mount_point);
    }
    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;

    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    // Use fusermount/umount
    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_drop_cache(mount_point: &Path) -> Result<()> {
    std::fs::write(mount_point.join(DROP_CACHE_NAME), b"")?;
    info!("Dropped caches of {:?}", mount_point);
    Ok(())
}

fn cmd_deletions(rw_dir: PathBuf, deletion_dir: &str) -> Result<()> {
    let branch = LocalBranch::new(rw_dir)?;
    for path in deleted_paths(&branch, deletion_dir)? {
        println!("{}", path);
    }
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
