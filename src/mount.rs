//! Mount bookkeeping and target-path handling

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};

/// Prefix of the daemon profile backing a node mount
pub const MOUNT_PROFILE_PREFIX: &str = "rclone-mounter-";

/// Prefix of the short-lived profile used for remote provisioning
pub const PROVISION_PROFILE_PREFIX: &str = "rclone-provisioner-";

/// Longest profile name the daemon side accepts
const MAX_PROFILE_LEN: usize = 63;

/// Daemon profile name for a volume mount
pub fn profile_name(volume_id: &str) -> String {
    scoped_profile_name(MOUNT_PROFILE_PREFIX, volume_id)
}

/// `<prefix><volume_id>`, lowercased and cut to 63 characters
pub fn scoped_profile_name(prefix: &str, volume_id: &str) -> String {
    format!("{}{}", prefix, volume_id)
        .chars()
        .take(MAX_PROFILE_LEN)
        .collect::<String>()
        .to_lowercase()
}

/// A live mount created by publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountContext {
    pub target_path: String,
    pub volume_id: String,
    /// Daemon profile the mount was created from
    pub profile: String,
    /// `profile:path` handed to the daemon
    pub fs: String,
}

/// Mount contexts keyed by target path
#[derive(Default)]
pub struct MountContextStore {
    contexts: RwLock<HashMap<String, MountContext>>,
}

impl MountContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mount, replacing any earlier context for the same target
    pub fn insert(&self, context: MountContext) {
        self.contexts
            .write()
            .insert(context.target_path.clone(), context);
    }

    pub fn get(&self, target_path: &str) -> Option<MountContext> {
        self.contexts.read().get(target_path).cloned()
    }

    pub fn remove(&self, target_path: &str) -> Option<MountContext> {
        self.contexts.write().remove(target_path)
    }

    /// Get the number of live mounts
    pub fn count(&self) -> usize {
        self.contexts.read().len()
    }

    /// Target paths of all live mounts
    pub fn targets(&self) -> Vec<String> {
        self.contexts.read().keys().cloned().collect()
    }
}

/// The host's view of mounted filesystems
pub trait MountTable: Send + Sync {
    fn is_mount_point(&self, path: &Path) -> Result<bool>;

    /// Detach whatever is mounted at `path`
    fn unmount(&self, path: &Path) -> Result<()>;
}

/// [`MountTable`] backed by `/proc/self/mounts` and `umount2(2)`
pub struct ProcMountTable {
    mounts_file: PathBuf,
}

impl ProcMountTable {
    pub fn new() -> Self {
        Self {
            mounts_file: PathBuf::from("/proc/self/mounts"),
        }
    }

    /// Read mount entries from another file in `/proc/self/mounts` format
    pub fn with_mounts_file(mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            mounts_file: mounts_file.into(),
        }
    }
}

impl Default for ProcMountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable for ProcMountTable {
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        let contents = fs::read_to_string(&self.mounts_file)?;
        let wanted = path.to_string_lossy();
        let wanted = wanted.trim_end_matches('/');

        // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
        Ok(contents
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mount_point| unescape_mount_point(mount_point) == wanted))
    }

    fn unmount(&self, path: &Path) -> Result<()> {
        umount2(path, MntFlags::MNT_DETACH).map_err(|e| {
            let err = io::Error::from(e);
            if err.kind() == io::ErrorKind::PermissionDenied {
                DriverError::PermissionDenied(format!("unmount {:?}: {}", path, err))
            } else {
                DriverError::Io(err)
            }
        })?;
        info!("Detached mount at {:?}", path);
        Ok(())
    }
}

/// Undo the octal escapes the kernel applies to whitespace in mount points
fn unescape_mount_point(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// State of a publish target before mounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Not a mount point (possibly missing)
    Unmounted,
    /// A readable mount point
    Healthy,
    /// A mount point whose contents cannot be listed
    Stale,
}

/// Classify a publish target
pub fn probe_target(table: &dyn MountTable, path: &Path) -> Result<TargetState> {
    if !path.exists() {
        // A stale FUSE mount also fails `exists`; only the mount table knows
        return if table.is_mount_point(path)? {
            Ok(TargetState::Stale)
        } else {
            Ok(TargetState::Unmounted)
        };
    }

    if !table.is_mount_point(path)? {
        return Ok(TargetState::Unmounted);
    }

    match fs::read_dir(path) {
        Ok(_) => Ok(TargetState::Healthy),
        Err(e) => {
            warn!("Mount point {:?} is not readable: {}", path, e);
            Ok(TargetState::Stale)
        }
    }
}

/// Unmount a target if mounted, then remove the directory.
///
/// A target that is already gone is not an error.
pub fn cleanup_mount_point(table: &dyn MountTable, path: &Path) -> Result<()> {
    if table.is_mount_point(path)? {
        debug!("Unmounting leftover mount at {:?}", path);
        table.unmount(path)?;
    }

    match fs::remove_dir(path) {
        Ok(()) => {
            debug!("Removed mount point {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
