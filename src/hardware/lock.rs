//! PV-Creation Lock
//!
//! An advisory `flock` per device, keyed by kernel name, so that two node
//! agent loops never race to publish the same device. Acquiring the lock
//! also reports every symlink under the symlink root that already resolves
//! to the device.

use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default directory holding the per-device lock files
pub const DEFAULT_LOCK_DIR: &str = "/run/lock/local-storage";

/// A held device lock; released on drop
#[derive(Debug)]
pub struct PvLock {
    file: File,
    path: PathBuf,
}

impl PvLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PvLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by `self.file` and still open.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!("Failed to unlock {}: {}", self.path.display(), io::Error::last_os_error());
        }
    }
}

/// Result of a lock attempt
#[derive(Debug)]
pub struct LockAcquisition {
    /// The held lock, `None` when another holder has it
    pub lock: Option<PvLock>,
    /// Symlinks under the root that already resolve to the device
    pub existing_symlinks: Vec<PathBuf>,
}

impl LockAcquisition {
    pub fn acquired(&self) -> bool {
        self.lock.is_some()
    }
}

/// Try to take the lock for a device without blocking
///
/// `device_node` is the device file the symlinks are expected to resolve
/// to. The symlink scan runs only when the lock was taken.
pub fn acquire(
    lock_dir: &Path,
    kname: &str,
    device_node: &Path,
    symlink_root: &Path,
) -> Result<LockAcquisition> {
    let lock_failed = |reason: String| Error::LockFailed {
        device: kname.to_string(),
        reason,
    };

    fs::create_dir_all(lock_dir).map_err(|e| lock_failed(format!("creating {}: {}", lock_dir.display(), e)))?;
    let path = lock_dir.join(format!("{}.lock", kname));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| lock_failed(format!("opening {}: {}", path.display(), e)))?;

    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            debug!("Lock {} is held elsewhere", path.display());
            return Ok(LockAcquisition {
                lock: None,
                existing_symlinks: Vec::new(),
            });
        }
        return Err(lock_failed(err.to_string()));
    }

    let lock = PvLock { file, path };
    let existing_symlinks = symlinks_resolving_to(symlink_root, device_node)?;
    Ok(LockAcquisition {
        lock: Some(lock),
        existing_symlinks,
    })
}

/// Every symlink below `root` whose resolution equals `device_node`
pub fn symlinks_resolving_to(root: &Path, device_node: &Path) -> Result<Vec<PathBuf>> {
    let Ok(device) = fs::canonicalize(device_node) else {
        return Ok(Vec::new());
    };

    let pattern = format!("{}/**/*", glob::Pattern::escape(&root.to_string_lossy()));
    let mut found = Vec::new();
    for entry in glob::glob(&pattern)?.filter_map(|e| e.ok()) {
        let is_link = fs::symlink_metadata(&entry)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link && fs::canonicalize(&entry).map_or(false, |t| t == device) {
            found.push(entry);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    struct Fixture {
        _tmp: tempfile::TempDir,
        lock_dir: PathBuf,
        root: PathBuf,
        sdb: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("dev");
        fs::create_dir_all(&dev).unwrap();
        let sdb = dev.join("sdb");
        fs::write(&sdb, b"").unwrap();
        fs::write(dev.join("sdc"), b"").unwrap();
        let root = tmp.path().join("local-storage");
        fs::create_dir_all(root.join("fast")).unwrap();
        fs::create_dir_all(root.join("slow")).unwrap();
        Fixture {
            lock_dir: tmp.path().join("lock"),
            root,
            sdb,
            _tmp: tmp,
        }
    }

    #[test]
    fn test_lock_is_exclusive() {
        let f = fixture();
        let first = acquire(&f.lock_dir, "sdb", &f.sdb, &f.root).unwrap();
        assert!(first.acquired());
        assert_eq!(first.lock.as_ref().unwrap().path(), f.lock_dir.join("sdb.lock"));

        let second = acquire(&f.lock_dir, "sdb", &f.sdb, &f.root).unwrap();
        assert!(!second.acquired());

        drop(first);
        let third = acquire(&f.lock_dir, "sdb", &f.sdb, &f.root).unwrap();
        assert!(third.acquired());
    }

    #[test]
    fn test_reports_existing_symlinks() {
        let f = fixture();
        symlink(&f.sdb, f.root.join("slow").join("wwn-b")).unwrap();
        symlink(f.sdb.with_file_name("sdc"), f.root.join("fast").join("sdc")).unwrap();

        let acq = acquire(&f.lock_dir, "sdb", &f.sdb, &f.root).unwrap();
        assert_eq!(acq.existing_symlinks, vec![f.root.join("slow").join("wwn-b")]);
    }

    #[test]
    fn test_missing_device_has_no_symlinks() {
        let f = fixture();
        let found = symlinks_resolving_to(&f.root, &f.root.join("nope")).unwrap();
        assert!(found.is_empty());
    }
}
