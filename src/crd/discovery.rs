//! Discovery CRDs
//!
//! LocalVolumeDiscovery asks for a device inventory on the selected nodes;
//! each node agent answers with one LocalVolumeDiscoveryResult.

use super::common::OperatorCondition;
use super::local_volume_set::DeviceMechanicalProperty;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{NodeSelector, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// LocalVolumeDiscovery CRD
// =============================================================================

/// LocalVolumeDiscovery runs a device inventory agent on the selected nodes.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "local.storage.openshift.io",
    version = "v1alpha1",
    kind = "LocalVolumeDiscovery",
    plural = "localvolumediscoveries",
    status = "LocalVolumeDiscoveryStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeDiscoverySpec {
    /// Nodes to inventory; absent matches every node
    #[serde(default)]
    pub node_selector: Option<NodeSelector>,

    /// Tolerations for the discovery agents
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

/// Discovery lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DiscoveryPhase {
    Discovering,
    DiscoveryFailed,
}

impl std::fmt::Display for DiscoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryPhase::Discovering => write!(f, "Discovering"),
            DiscoveryPhase::DiscoveryFailed => write!(f, "DiscoveryFailed"),
        }
    }
}

/// Status of the LocalVolumeDiscovery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeDiscoveryStatus {
    #[serde(default)]
    pub phase: Option<DiscoveryPhase>,

    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,

    #[serde(default)]
    pub observed_generation: Option<i64>,
}

// =============================================================================
// LocalVolumeDiscoveryResult CRD
// =============================================================================

/// Device inventory of a single node.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "local.storage.openshift.io",
    version = "v1alpha1",
    kind = "LocalVolumeDiscoveryResult",
    plural = "localvolumediscoveryresults",
    status = "LocalVolumeDiscoveryResultStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeDiscoveryResultSpec {
    /// Node the inventory was taken on
    pub node_name: String,
}

/// Availability of a discovered device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceAvailability {
    Available,
    NotAvailable,
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceAvailability::Available => write!(f, "Available"),
            DeviceAvailability::NotAvailable => write!(f, "NotAvailable"),
            DeviceAvailability::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A device found on the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    /// Stable /dev/disk/by-id path, empty when none exists
    #[serde(default)]
    pub device_id: String,
    /// Device file path
    pub path: String,
    #[serde(default)]
    pub model: String,
    /// lsblk device type
    pub r#type: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub serial: String,
    /// Size in bytes
    pub size: i64,
    pub property: DeviceMechanicalProperty,
    #[serde(default)]
    pub fstype: String,
    pub status: DeviceAvailability,
}

/// Status of a LocalVolumeDiscoveryResult
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeDiscoveryResultStatus {
    /// When the inventory was taken
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub discovered_time_stamp: Option<DateTime<Utc>>,

    /// Devices found on the node
    #[serde(default)]
    pub discovered_devices: Vec<DiscoveredDevice>,
}

/// Name of the result object for a node
pub fn discovery_result_name(node_name: &str) -> String {
    format!("discovery-result-{}", node_name)
}
