//! On-Node Deleter
//!
//! Reclaims persistent volumes this node provisioned once they are
//! Released: optionally wipes the device, removes the symlink, then
//! deletes the PV object. PVs carrying another node's provisioner
//! identity are never touched.

use crate::crd::LocalVolume;
use crate::diskmaker::pv::{phase, provisioned_by};
use crate::diskmaker::runtime::RuntimeConfig;
use crate::domain::ports::{DeviceWiperRef, VolumeApiRef};
use crate::error::Result;
use crate::hardware::symlink;
use k8s_openapi::api::core::v1::PersistentVolume;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interval between reclaim passes
pub const DEFAULT_DELETER_TICK: Duration = Duration::from_secs(30);

const PHASE_RELEASED: &str = "Released";
const RECLAIM_DELETE: &str = "Delete";

/// Outcome of one reclaim pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Storage classes whose LocalVolume entry asks for a destructive wipe
pub fn force_wipe_classes<'a>(volumes: impl IntoIterator<Item = &'a LocalVolume>) -> HashSet<String> {
    volumes
        .into_iter()
        .flat_map(|lv| lv.spec.storage_class_devices.iter())
        .filter(|scd| scd.force_wipe_devices_and_destroy_all_data)
        .map(|scd| scd.storage_class_name.clone())
        .collect()
}

pub struct Deleter {
    volumes: VolumeApiRef,
    wiper: DeviceWiperRef,
}

impl Deleter {
    pub fn new(volumes: VolumeApiRef, wiper: DeviceWiperRef) -> Self {
        Self { volumes, wiper }
    }

    /// Whether this node should reclaim the PV now
    pub fn should_reclaim(pv: &PersistentVolume, runtime: &RuntimeConfig) -> bool {
        if provisioned_by(pv) != Some(runtime.provisioner_name.as_str()) {
            return false;
        }
        let delete_policy = pv
            .spec
            .as_ref()
            .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
            == Some(RECLAIM_DELETE);
        phase(pv) == Some(PHASE_RELEASED) && delete_policy
    }

    /// Run one reclaim pass over the cached PVs
    pub async fn reclaim(
        &self,
        cached: &[PersistentVolume],
        runtime: &RuntimeConfig,
        force_wipe: &HashSet<String>,
    ) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        for pv in cached.iter().filter(|pv| Self::should_reclaim(pv, runtime)) {
            let name = pv.metadata.name.clone().unwrap_or_default();
            match self.reclaim_one(pv, runtime, force_wipe).await {
                Ok(()) => report.deleted.push(name),
                Err(e) => {
                    warn!("Failed to reclaim {}: {}", name, e);
                    report.failed.push(name);
                }
            }
        }
        report
    }

    async fn reclaim_one(
        &self,
        pv: &PersistentVolume,
        runtime: &RuntimeConfig,
        force_wipe: &HashSet<String>,
    ) -> Result<()> {
        let name = pv.metadata.name.clone().unwrap_or_default();
        let spec = pv.spec.as_ref();
        let storage_class = spec
            .and_then(|s| s.storage_class_name.clone())
            .unwrap_or_default();

        if let Some(path) = spec.and_then(|s| s.local.as_ref()).map(|l| l.path.as_str()) {
            let link = mount_path(Path::new(path), &storage_class, runtime);
            if force_wipe.contains(&storage_class) {
                self.wiper.wipe(&link).await?;
            }
            symlink::remove_link(&link)?;
        } else {
            debug!("{} has no local path, deleting object only", name);
        }

        self.volumes.delete_pv(&name).await?;
        info!("Reclaimed persistent volume {}", name);
        Ok(())
    }
}

/// Translate a PV path from the host view to the container view
pub fn mount_path(host_path: &Path, storage_class: &str, runtime: &RuntimeConfig) -> PathBuf {
    let Some(cfg) = runtime.storage_classes.get(storage_class) else {
        return host_path.to_path_buf();
    };
    match host_path.strip_prefix(&cfg.host_dir) {
        Ok(rest) => Path::new(&cfg.mount_dir).join(rest),
        Err(_) => host_path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LocalVolumeSpec, StorageClassDevice, VolumeMode};
    use crate::diskmaker::runtime::{MountConfig, NodeIdentity};
    use crate::domain::labels::PROVISIONED_BY_ANNOTATION;
    use crate::testing::{FakeVolumeApi, RecordingWiper};
    use k8s_openapi::api::core::v1::{LocalVolumeSource, PersistentVolumeSpec, PersistentVolumeStatus};
    use kube::api::ObjectMeta;
    use std::fs;
    use std::sync::Arc;

    fn runtime(root: &Path) -> RuntimeConfig {
        let node = NodeIdentity {
            name: "worker-1".into(),
            uid: "u1".into(),
            ..Default::default()
        };
        RuntimeConfig::new(node, root)
    }

    fn pv(name: &str, provisioner: &str, phase: &str, policy: &str, path: &Path) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                annotations: Some([(PROVISIONED_BY_ANNOTATION.to_string(), provisioner.to_string())].into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                storage_class_name: Some("fast".into()),
                persistent_volume_reclaim_policy: Some(policy.into()),
                local: Some(LocalVolumeSource {
                    path: path.display().to_string(),
                    fs_type: None,
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_only_own_released_delete_pvs_are_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = runtime(tmp.path());
        let dir = tmp.path().join("fast");
        fs::create_dir_all(&dir).unwrap();
        for link in ["a", "b", "c", "d"] {
            std::os::unix::fs::symlink("/dev/null", dir.join(link)).unwrap();
        }

        let me = rt.provisioner_name.clone();
        let cached = vec![
            pv("pv-a", &me, "Released", "Delete", &dir.join("a")),
            pv("pv-b", &me, "Bound", "Delete", &dir.join("b")),
            pv("pv-c", &me, "Released", "Retain", &dir.join("c")),
            pv("pv-d", "local-volume-provisioner-worker-2-u2", "Released", "Delete", &dir.join("d")),
        ];
        let api = Arc::new(FakeVolumeApi::default());
        for p in &cached {
            api.insert(p.clone());
        }
        let wiper = Arc::new(RecordingWiper::default());
        let deleter = Deleter::new(api.clone(), wiper.clone());

        let report = deleter.reclaim(&cached, &rt, &HashSet::new()).await;

        assert_eq!(report.deleted, vec!["pv-a".to_string()]);
        assert_eq!(api.deleted(), vec!["pv-a".to_string()]);
        assert!(fs::symlink_metadata(dir.join("a")).is_err());
        for kept in ["b", "c", "d"] {
            assert!(fs::symlink_metadata(dir.join(kept)).is_ok());
        }
        assert!(wiper.wiped().is_empty());
    }

    #[tokio::test]
    async fn test_force_wipe_runs_before_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = runtime(tmp.path());
        let link = tmp.path().join("fast").join("sdb");
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink("/dev/null", &link).unwrap();

        let api = Arc::new(FakeVolumeApi::default());
        let wiper = Arc::new(RecordingWiper::default());
        let deleter = Deleter::new(api.clone(), wiper.clone());
        let cached = vec![pv("pv-a", &rt.provisioner_name, "Released", "Delete", &link)];

        let mut lv = LocalVolume::new(
            "disks",
            LocalVolumeSpec {
                storage_class_devices: vec![StorageClassDevice {
                    storage_class_name: "fast".into(),
                    force_wipe_devices_and_destroy_all_data: true,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        lv.metadata.namespace = Some("lso".into());
        let wipe = force_wipe_classes([&lv]);

        let report = deleter.reclaim(&cached, &rt, &wipe).await;
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(wiper.wiped(), vec![link]);
    }

    #[test]
    fn test_mount_path_translation() {
        let mut rt = runtime(Path::new("/mnt/local-storage"));
        rt.storage_classes.insert(
            "fast".into(),
            MountConfig {
                fs_type: String::new(),
                host_dir: "/mnt/local-storage/fast".into(),
                mount_dir: "/host/fast".into(),
                volume_mode: VolumeMode::Block,
            },
        );
        assert_eq!(
            mount_path(Path::new("/mnt/local-storage/fast/sdb"), "fast", &rt),
            PathBuf::from("/host/fast/sdb")
        );
        assert_eq!(
            mount_path(Path::new("/elsewhere/sdb"), "slow", &rt),
            PathBuf::from("/elsewhere/sdb")
        );
    }
}
