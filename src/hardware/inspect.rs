//! Host Device Inspector
//!
//! Answers the per-device questions the provisioner and discovery loops
//! ask of the host: can the device be opened exclusively, is it bind
//! mounted, which /dev/disk/by-id entry names it, and what does a
//! user-supplied path resolve to.

use crate::domain::ports::{DeviceInspector, DeviceWiper, ResolvedPath};
use crate::error::{Error, Result};
use crate::hardware::blockdev::BlockDevice;
use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

// =============================================================================
// Constants
// =============================================================================

pub const DEV_DIR: &str = "/dev";
pub const DISK_BY_ID_DIR: &str = "/dev/disk/by-id";
pub const MOUNTINFO_PATH: &str = "/proc/1/mountinfo";

// =============================================================================
// Host Inspector
// =============================================================================

/// Inspects devices through the host filesystem
#[derive(Debug, Clone)]
pub struct HostInspector {
    dev_dir: PathBuf,
    by_id_dir: PathBuf,
    mountinfo_path: PathBuf,
}

impl Default for HostInspector {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from(DEV_DIR),
            by_id_dir: PathBuf::from(DISK_BY_ID_DIR),
            mountinfo_path: PathBuf::from(MOUNTINFO_PATH),
        }
    }
}

impl HostInspector {
    /// Create an inspector rooted at alternate paths (for testing)
    pub fn with_paths(
        dev_dir: impl Into<PathBuf>,
        by_id_dir: impl Into<PathBuf>,
        mountinfo_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            by_id_dir: by_id_dir.into(),
            mountinfo_path: mountinfo_path.into(),
        }
    }

    fn device_node(&self, device: &BlockDevice) -> PathBuf {
        self.dev_dir.join(&device.kname)
    }
}

impl DeviceInspector for HostInspector {
    fn can_open_exclusively(&self, device: &BlockDevice) -> Result<bool> {
        let node = self.device_node(device);
        match fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_EXCL)
            .open(&node)
        {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                debug!("{} is busy", node.display());
                Ok(false)
            }
            Err(e) => Err(Error::DevicePredicate {
                predicate: "can-open-exclusively".into(),
                device: node.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn has_bind_mounts(&self, device: &BlockDevice) -> Result<bool> {
        let contents = fs::read_to_string(&self.mountinfo_path).map_err(|e| Error::DevicePredicate {
            predicate: "has-bind-mounts".into(),
            device: device.kname.clone(),
            reason: format!("reading {}: {}", self.mountinfo_path.display(), e),
        })?;
        Ok(mountinfo_references(&contents, &device.kname))
    }

    fn path_by_id(&self, device: &BlockDevice) -> Result<PathBuf> {
        let not_found = || Error::IdPathNotFound {
            kname: device.kname.clone(),
        };
        let entries = match fs::read_dir(&self.by_id_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        let target = fs::canonicalize(self.device_node(device)).ok();
        let mut names: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        names.sort();

        for name in names {
            let link = self.by_id_dir.join(&name);
            let Ok(resolved) = fs::canonicalize(&link) else {
                continue;
            };
            let matches = match &target {
                Some(target) => &resolved == target,
                None => resolved.file_name().map_or(false, |n| n == device.kname.as_str()),
            };
            if matches {
                return Ok(link);
            }
        }

        Err(not_found())
    }

    fn resolve(&self, path: &Path) -> Result<ResolvedPath> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ResolvedPath::Missing),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            return Ok(ResolvedPath::Directory);
        }
        if metadata.file_type().is_block_device() {
            let canonical = fs::canonicalize(path)?;
            let kname = canonical
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| Error::Internal(format!("no file name in {}", canonical.display())))?;
            return Ok(ResolvedPath::Device { kname });
        }
        Ok(ResolvedPath::RegularFile)
    }
}

/// Whether mountinfo contents show a mount backed by the device
///
/// Matches a mount whose source is `/dev/<kname>`, and a devtmpfs mount
/// whose root is `/<kname>` (a bind mount of the device node itself).
pub fn mountinfo_references(contents: &str, kname: &str) -> bool {
    let dev_source = format!("/dev/{}", kname);
    let node_root = format!("/{}", kname);

    contents.lines().any(|line| {
        let Some((left, right)) = line.split_once(" - ") else {
            return false;
        };
        let left: Vec<&str> = left.split_whitespace().collect();
        let right: Vec<&str> = right.split_whitespace().collect();
        let (Some(root), Some(fstype), Some(source)) = (left.get(3), right.first(), right.get(1)) else {
            return false;
        };

        *source == dev_source || (*fstype == "devtmpfs" && *root == node_root)
    })
}

// =============================================================================
// Wiper
// =============================================================================

/// Wipes filesystem signatures with wipefs
#[derive(Debug, Clone, Default)]
pub struct WipefsWiper;

#[async_trait]
impl DeviceWiper for WipefsWiper {
    async fn wipe(&self, device: &Path) -> Result<()> {
        info!("Wiping {}", device.display());
        let output = Command::new("wipefs")
            .arg("--all")
            .arg("--force")
            .arg(device)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Internal(format!(
                "wipefs {} failed: {}",
                device.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
