//! Node Runtime Configuration
//!
//! The state a node agent needs before it can touch a device: its own
//! identity, the host paths it works under, and the per-storage-class
//! mount configuration published in the shared `local-provisioner`
//! config map.

use crate::crd::VolumeMode;
use crate::domain::labels::provisioner_name;
use crate::error::{Error, Result};
use crate::hardware::inspect::{DEV_DIR, DISK_BY_ID_DIR};
use crate::hardware::lock::DEFAULT_LOCK_DIR;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the shared provisioner config map
pub const PROVISIONER_CONFIGMAP: &str = "local-provisioner";

/// Default root of the per-storage-class symlink directories
pub const DEFAULT_SYMLINK_ROOT: &str = "/mnt/local-storage";

// =============================================================================
// Shared Config Map
// =============================================================================

/// Mount configuration of one storage class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountConfig {
    #[serde(default, rename = "fsType")]
    pub fs_type: String,
    /// Directory on the host holding the class's symlinks
    pub host_dir: String,
    /// Same directory as seen by the provisioner container
    pub mount_dir: String,
    #[serde(default)]
    pub volume_mode: VolumeMode,
}

impl MountConfig {
    /// Configuration for a class rooted at `root/<storage_class>`
    pub fn under(root: &Path, storage_class: &str, volume_mode: VolumeMode, fs_type: &str) -> Self {
        let dir = root.join(storage_class).display().to_string();
        Self {
            fs_type: fs_type.to_string(),
            host_dir: dir.clone(),
            mount_dir: dir,
            volume_mode,
        }
    }
}

/// Storage-class name to mount configuration
pub type StorageClassConfigs = BTreeMap<String, MountConfig>;

/// Render config map data, one YAML document per storage class
pub fn encode_config_data(configs: &StorageClassConfigs) -> Result<BTreeMap<String, String>> {
    configs
        .iter()
        .map(|(sc, cfg)| Ok((sc.clone(), serde_yaml::to_string(cfg)?)))
        .collect()
}

/// Parse config map data written by [`encode_config_data`]
pub fn decode_config_data(data: &BTreeMap<String, String>) -> Result<StorageClassConfigs> {
    data.iter()
        .map(|(sc, raw)| {
            let cfg: MountConfig = serde_yaml::from_str(raw).map_err(|e| {
                Error::Configuration(format!("invalid entry {} in {}: {}", sc, PROVISIONER_CONFIGMAP, e))
            })?;
            Ok((sc.clone(), cfg))
        })
        .collect()
}

// =============================================================================
// Runtime Config
// =============================================================================

/// Identity of the node an agent runs on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeIdentity {
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
}

/// Everything one provisioning pass needs to know about its node
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub node: NodeIdentity,
    /// `local-volume-provisioner-<node>-<uid>`
    pub provisioner_name: String,
    pub symlink_root: PathBuf,
    pub lock_dir: PathBuf,
    pub dev_dir: PathBuf,
    pub by_id_dir: PathBuf,
    pub storage_classes: StorageClassConfigs,
}

impl RuntimeConfig {
    pub fn new(node: NodeIdentity, symlink_root: impl Into<PathBuf>) -> Self {
        Self {
            provisioner_name: provisioner_name(&node.name, &node.uid),
            node,
            symlink_root: symlink_root.into(),
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            dev_dir: PathBuf::from(DEV_DIR),
            by_id_dir: PathBuf::from(DISK_BY_ID_DIR),
            storage_classes: StorageClassConfigs::new(),
        }
    }

    pub fn with_lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = lock_dir.into();
        self
    }

    pub fn with_device_dirs(mut self, dev_dir: impl Into<PathBuf>, by_id_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self.by_id_dir = by_id_dir.into();
        self
    }

    /// Take the node's current labels; name, UID and provisioner identity stay
    pub fn apply_node_labels(&mut self, labels: BTreeMap<String, String>) {
        self.node.labels = labels;
    }

    /// Replace the storage-class configuration from config map data
    pub fn load_config_data(&mut self, data: &BTreeMap<String, String>) -> Result<()> {
        self.storage_classes = decode_config_data(data)?;
        Ok(())
    }

    /// Directory holding a storage class's symlinks
    pub fn storage_class_dir(&self, storage_class: &str) -> PathBuf {
        self.storage_classes
            .get(storage_class)
            .map(|cfg| PathBuf::from(&cfg.mount_dir))
            .unwrap_or_else(|| self.symlink_root.join(storage_class))
    }

    /// Device node for a kernel name
    pub fn device_node(&self, kname: &str) -> PathBuf {
        self.dev_dir.join(kname)
    }

    /// Whether a user-supplied path is a stable by-id link
    pub fn is_by_id_path(&self, path: &Path) -> bool {
        path.starts_with(&self.by_id_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_data_round_trip() {
        let mut configs = StorageClassConfigs::new();
        configs.insert(
            "fast".into(),
            MountConfig::under(Path::new("/mnt/local-storage"), "fast", VolumeMode::Block, ""),
        );
        let data = encode_config_data(&configs).unwrap();
        assert!(data["fast"].contains("hostDir: /mnt/local-storage/fast"));
        assert!(data["fast"].contains("volumeMode: Block"));
        assert_eq!(decode_config_data(&data).unwrap(), configs);
    }

    #[test]
    fn test_invalid_config_entry() {
        let mut data = BTreeMap::new();
        data.insert("fast".to_string(), "volumeMode: [".to_string());
        assert!(matches!(decode_config_data(&data), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_runtime_paths() {
        let node = NodeIdentity {
            name: "worker-1".into(),
            uid: "uid-1".into(),
            ..Default::default()
        };
        let mut runtime = RuntimeConfig::new(node, "/mnt/local-storage");
        assert_eq!(runtime.provisioner_name, "local-volume-provisioner-worker-1-uid-1");
        assert_eq!(runtime.storage_class_dir("slow"), PathBuf::from("/mnt/local-storage/slow"));

        runtime.storage_classes.insert(
            "fast".into(),
            MountConfig::under(Path::new("/data"), "fast", VolumeMode::Filesystem, "xfs"),
        );
        assert_eq!(runtime.storage_class_dir("fast"), PathBuf::from("/data/fast"));
        assert!(runtime.is_by_id_path(Path::new("/dev/disk/by-id/wwn-1")));
        assert!(!runtime.is_by_id_path(Path::new("/dev/sdb")));
    }

    #[test]
    fn test_node_labels_refresh_keeps_identity() {
        let node = NodeIdentity {
            name: "worker-1".into(),
            uid: "uid-1".into(),
            labels: [("disktype".to_string(), "hdd".to_string())].into(),
        };
        let mut runtime = RuntimeConfig::new(node, "/mnt/local-storage");
        runtime.apply_node_labels([("disktype".to_string(), "ssd".to_string())].into());

        assert_eq!(runtime.node.labels["disktype"], "ssd");
        assert_eq!(runtime.node.name, "worker-1");
        assert_eq!(runtime.provisioner_name, "local-volume-provisioner-worker-1-uid-1");
    }
}
