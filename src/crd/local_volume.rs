//! LocalVolume CRD
//!
//! A LocalVolume names explicit device paths per storage class. The node
//! agents on matching nodes symlink those devices and publish one
//! persistent volume per device.

use super::common::{GenerationStatus, LogLevel, ManagementState, OperatorCondition, VolumeMode};
use k8s_openapi::api::core::v1::{NodeSelector, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// LocalVolume CRD
// =============================================================================

/// LocalVolume turns a fixed list of device paths into local persistent volumes.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "local.storage.openshift.io",
    version = "v1",
    kind = "LocalVolume",
    plural = "localvolumes",
    shortname = "lv",
    status = "LocalVolumeStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".spec.managementState"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSpec {
    /// Management state of the resource
    #[serde(default)]
    pub management_state: ManagementState,

    /// Log level of the node agents
    #[serde(default)]
    pub log_level: LogLevel,

    /// Nodes the devices are expected on; absent matches every node
    #[serde(default)]
    pub node_selector: Option<NodeSelector>,

    /// Devices to provision, grouped by storage class
    #[serde(default)]
    pub storage_class_devices: Vec<StorageClassDevice>,

    /// Tolerations for the node agents
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

/// Devices belonging to a single storage class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassDevice {
    /// Storage class the volumes are published under
    pub storage_class_name: String,

    /// Volume mode of the published volumes
    #[serde(default)]
    pub volume_mode: VolumeMode,

    /// Filesystem type for Filesystem volumes
    #[serde(default, rename = "fsType")]
    pub fs_type: String,

    /// Device files or /dev/disk/by-id paths
    #[serde(default)]
    pub device_paths: Vec<String>,

    /// Wipe devices when their volumes are reclaimed
    #[serde(default)]
    pub force_wipe_devices_and_destroy_all_data: bool,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the LocalVolume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeStatus {
    /// Generation last acted upon
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Management state observed on the last pass
    #[serde(default)]
    pub management_state: Option<ManagementState>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,

    /// Ready diskmaker pods
    #[serde(default)]
    pub ready_replicas: i32,

    /// Generations of owned workloads
    #[serde(default)]
    pub generations: Vec<GenerationStatus>,
}

// =============================================================================
// Implementations
// =============================================================================

impl LocalVolume {
    /// Storage class names declared by the spec, in spec order
    pub fn storage_class_names(&self) -> Vec<String> {
        self.spec
            .storage_class_devices
            .iter()
            .map(|d| d.storage_class_name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_on_ingest() {
        let spec: LocalVolumeSpec = serde_json::from_value(serde_json::json!({
            "storageClassDevices": [{
                "storageClassName": "local-sc",
                "devicePaths": ["/dev/sdb"]
            }]
        }))
        .unwrap();

        assert_eq!(spec.log_level, LogLevel::Normal);
        assert_eq!(spec.management_state, ManagementState::Managed);
        assert_eq!(spec.storage_class_devices[0].volume_mode, VolumeMode::Filesystem);
        assert!(!spec.storage_class_devices[0].force_wipe_devices_and_destroy_all_data);
        assert!(spec.node_selector.is_none());
    }

    #[test]
    fn test_deep_copy_is_equal() {
        let mut lv = LocalVolume::new(
            "local-disks",
            LocalVolumeSpec {
                storage_class_devices: vec![StorageClassDevice {
                    storage_class_name: "local-sc".into(),
                    volume_mode: VolumeMode::Block,
                    fs_type: String::new(),
                    device_paths: vec!["/dev/disk/by-id/wwn-X".into()],
                    force_wipe_devices_and_destroy_all_data: true,
                }],
                ..Default::default()
            },
        );
        lv.status = Some(LocalVolumeStatus {
            observed_generation: Some(3),
            ready_replicas: 2,
            ..Default::default()
        });
        let copy = lv.clone();
        assert_eq!(copy, lv);
        assert_eq!(lv.storage_class_names(), vec!["local-sc".to_string()]);
    }
}
