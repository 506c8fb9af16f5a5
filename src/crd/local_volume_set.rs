//! LocalVolumeSet CRD
//!
//! A LocalVolumeSet selects devices by filter instead of by path. Every
//! device on a matching node that passes the inclusion spec becomes a
//! persistent volume of the set's single storage class.

use super::common::{OperatorCondition, VolumeMode};
use crate::error::Error;
use k8s_openapi::api::core::v1::{NodeSelector, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default minimum device size (1 GiB)
pub const DEFAULT_MIN_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

// =============================================================================
// LocalVolumeSet CRD
// =============================================================================

/// LocalVolumeSet provisions every matching device on the selected nodes.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "local.storage.openshift.io",
    version = "v1alpha1",
    kind = "LocalVolumeSet",
    plural = "localvolumesets",
    shortname = "lvset",
    status = "LocalVolumeSetStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name": "StorageClass", "type": "string", "jsonPath": ".spec.storageClassName"}"#,
    printcolumn = r#"{"name": "Provisioned", "type": "integer", "jsonPath": ".status.totalProvisionedDeviceCount"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSetSpec {
    /// Nodes to provision on; absent matches every node
    #[serde(default)]
    pub node_selector: Option<NodeSelector>,

    /// Storage class of every volume of the set
    pub storage_class_name: String,

    /// Maximum number of devices per node
    #[serde(default)]
    pub max_device_count: Option<i32>,

    /// Volume mode of the published volumes
    #[serde(default)]
    pub volume_mode: VolumeMode,

    /// Filesystem type for Filesystem volumes
    #[serde(default, rename = "fsType")]
    pub fs_type: String,

    /// Tolerations for the node agents
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Device filter
    #[serde(default)]
    pub device_inclusion_spec: Option<DeviceInclusionSpec>,
}

// =============================================================================
// Device Inclusion
// =============================================================================

/// Block device types a set may claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Disk,
    Part,
    Loop,
    Mpath,
}

impl DeviceType {
    /// Parse an lsblk TYPE column
    pub fn from_lsblk(value: &str) -> Option<Self> {
        match value {
            "disk" => Some(DeviceType::Disk),
            "part" => Some(DeviceType::Part),
            "loop" => Some(DeviceType::Loop),
            "mpath" => Some(DeviceType::Mpath),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Disk => write!(f, "disk"),
            DeviceType::Part => write!(f, "part"),
            DeviceType::Loop => write!(f, "loop"),
            DeviceType::Mpath => write!(f, "mpath"),
        }
    }
}

/// Whether a device spins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DeviceMechanicalProperty {
    Rotational,
    NonRotational,
}

impl std::fmt::Display for DeviceMechanicalProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMechanicalProperty::Rotational => write!(f, "Rotational"),
            DeviceMechanicalProperty::NonRotational => write!(f, "NonRotational"),
        }
    }
}

/// Filter applied to every block device on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInclusionSpec {
    /// Allowed device types
    #[serde(default = "default_device_types")]
    pub device_types: Vec<DeviceType>,

    /// Allowed mechanical properties
    #[serde(default = "default_mechanical_properties")]
    pub device_mechanical_properties: Vec<DeviceMechanicalProperty>,

    /// Minimum device size
    #[serde(default = "default_min_size")]
    pub min_size: Option<Quantity>,

    /// Maximum device size
    #[serde(default)]
    pub max_size: Option<Quantity>,

    /// Model substrings, any of which must match
    #[serde(default)]
    pub models: Vec<String>,

    /// Vendor substrings, any of which must match
    #[serde(default)]
    pub vendors: Vec<String>,
}

impl Default for DeviceInclusionSpec {
    fn default() -> Self {
        Self {
            device_types: default_device_types(),
            device_mechanical_properties: default_mechanical_properties(),
            min_size: default_min_size(),
            max_size: None,
            models: Vec::new(),
            vendors: Vec::new(),
        }
    }
}

impl DeviceInclusionSpec {
    /// Size window in bytes
    ///
    /// An absent `minSize` means 1 GiB and an absent `maxSize` means
    /// unbounded. A quantity that does not parse is an error, never a
    /// fallback to those defaults.
    pub fn size_bounds(&self) -> crate::error::Result<SizeBounds> {
        let min = match &self.min_size {
            Some(q) => parse_size("minSize", q)?,
            None => DEFAULT_MIN_SIZE_BYTES,
        };
        let max = self
            .max_size
            .as_ref()
            .map(|q| parse_size("maxSize", q))
            .transpose()?;
        if let Some(max) = max {
            if max < min {
                return Err(Error::Configuration(format!(
                    "maxSize ({} bytes) is smaller than minSize ({} bytes)",
                    max, min
                )));
            }
        }
        Ok(SizeBounds { min, max })
    }
}

/// Inclusive device size window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBounds {
    pub min: u64,
    pub max: Option<u64>,
}

impl SizeBounds {
    pub fn contains(&self, size: u64) -> bool {
        size >= self.min && self.max.map_or(true, |max| size <= max)
    }
}

fn parse_size(field: &str, quantity: &Quantity) -> crate::error::Result<u64> {
    parse_quantity(&quantity.0).ok_or_else(|| Error::InvalidQuantity {
        field: field.to_string(),
        value: quantity.0.clone(),
    })
}

// =============================================================================
// Status
// =============================================================================

/// Status of the LocalVolumeSet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSetStatus {
    /// Conditions
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,

    /// Persistent volumes of the set's storage class
    #[serde(default)]
    pub total_provisioned_device_count: Option<i32>,

    /// Generation last acted upon
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_device_types() -> Vec<DeviceType> {
    vec![DeviceType::Disk]
}

fn default_mechanical_properties() -> Vec<DeviceMechanicalProperty> {
    vec![
        DeviceMechanicalProperty::Rotational,
        DeviceMechanicalProperty::NonRotational,
    ]
}

fn default_min_size() -> Option<Quantity> {
    Some(Quantity("1Gi".to_string()))
}

// =============================================================================
// Implementations
// =============================================================================

impl LocalVolumeSet {
    /// Inclusion spec with defaults filled in
    pub fn inclusion(&self) -> DeviceInclusionSpec {
        self.spec.device_inclusion_spec.clone().unwrap_or_default()
    }
}

/// Parse a Kubernetes quantity into bytes
///
/// Accepts the full quantity grammar: an optionally signed decimal number
/// followed by a binary SI suffix (`Ki`..`Ei`), a decimal SI suffix
/// (`n`, `u`, `m`, `k`..`E`) or a decimal exponent (`e3`, `E-2`).
/// Fractional byte counts round up. Negative values have no byte count.
pub fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    let unsigned = value.strip_prefix('+').unwrap_or(value);
    let split = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(split);
    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return None;
    }
    let number: f64 = number.parse().ok()?;

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        exponent if exponent.starts_with(['e', 'E']) => {
            let power: i32 = exponent[1..].parse().ok()?;
            10f64.powi(power)
        }
        _ => return None,
    };

    let bytes = number * multiplier;
    let rounded = bytes.round();
    let bytes = if (bytes - rounded).abs() < 1e-6 { rounded } else { bytes.ceil() };
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return None;
    }
    Some(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("1Gi"), Some(1_073_741_824));
        assert_eq!(parse_quantity("10G"), Some(10_000_000_000));
        assert_eq!(parse_quantity("512"), Some(512));
        assert_eq!(parse_quantity("1.5Ki"), Some(1536));
        assert_eq!(parse_quantity("+2Ki"), Some(2048));
        assert_eq!(parse_quantity(".5k"), Some(500));
        assert_eq!(parse_quantity("1500m"), Some(2));
        assert_eq!(parse_quantity("12Qi"), None);
        assert_eq!(parse_quantity("Gi"), None);
        assert_eq!(parse_quantity("-1Gi"), None);
        assert_eq!(parse_quantity("1.2.3"), None);
    }

    #[test]
    fn test_parse_exponent_quantities() {
        assert_eq!(parse_quantity("1e9"), Some(1_000_000_000));
        assert_eq!(parse_quantity("5E8"), Some(500_000_000));
        assert_eq!(parse_quantity("2.5e3"), Some(2500));
        assert_eq!(parse_quantity("1e+3"), Some(1000));
        assert_eq!(parse_quantity("3000e-3"), Some(3));
        assert_eq!(parse_quantity("1E"), Some(1_000_000_000_000_000_000));
        assert_eq!(parse_quantity("1e"), None);
        assert_eq!(parse_quantity("1e3x"), None);
        assert_eq!(parse_quantity("1e400"), None);
    }

    #[test]
    fn test_size_bounds() {
        let spec = DeviceInclusionSpec {
            min_size: Some(Quantity("5E8".into())),
            max_size: Some(Quantity("1e9".into())),
            ..Default::default()
        };
        let bounds = spec.size_bounds().unwrap();
        assert_eq!(bounds, SizeBounds { min: 500_000_000, max: Some(1_000_000_000) });
        assert!(bounds.contains(1_000_000_000));
        assert!(!bounds.contains(1_000_000_001));
        assert!(!bounds.contains(499_999_999));

        let unbounded = DeviceInclusionSpec {
            min_size: None,
            ..Default::default()
        };
        assert_eq!(
            unbounded.size_bounds().unwrap(),
            SizeBounds { min: DEFAULT_MIN_SIZE_BYTES, max: None }
        );
    }

    #[test]
    fn test_unparsable_size_is_an_error() {
        let bad_max = DeviceInclusionSpec {
            max_size: Some(Quantity("10 gigs".into())),
            ..Default::default()
        };
        assert_matches!(
            bad_max.size_bounds(),
            Err(Error::InvalidQuantity { ref field, ref value }) if field == "maxSize" && value == "10 gigs"
        );

        let bad_min = DeviceInclusionSpec {
            min_size: Some(Quantity("big".into())),
            ..Default::default()
        };
        assert_matches!(bad_min.size_bounds(), Err(Error::InvalidQuantity { .. }));

        let inverted = DeviceInclusionSpec {
            min_size: Some(Quantity("10Gi".into())),
            max_size: Some(Quantity("1Gi".into())),
            ..Default::default()
        };
        assert_matches!(inverted.size_bounds(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_inclusion_defaults() {
        let lvset = LocalVolumeSet::new(
            "fast",
            LocalVolumeSetSpec {
                storage_class_name: "fast-sc".into(),
                ..Default::default()
            },
        );
        let inclusion = lvset.inclusion();
        assert_eq!(inclusion.device_types, vec![DeviceType::Disk]);
        assert_eq!(inclusion.device_mechanical_properties.len(), 2);
        assert_eq!(
            inclusion.size_bounds().unwrap(),
            SizeBounds { min: DEFAULT_MIN_SIZE_BYTES, max: None }
        );
        assert_eq!(lvset.spec.volume_mode, VolumeMode::Filesystem);
    }

    #[test]
    fn test_partial_inclusion_spec_defaults() {
        let spec: DeviceInclusionSpec =
            serde_json::from_value(serde_json::json!({ "models": ["SAMSUNG"] })).unwrap();
        assert_eq!(spec.device_types, vec![DeviceType::Disk]);
        assert_eq!(spec.size_bounds().unwrap().min, DEFAULT_MIN_SIZE_BYTES);
        assert_eq!(spec.models, vec!["SAMSUNG".to_string()]);
    }

    #[test]
    fn test_device_type_from_lsblk() {
        assert_eq!(DeviceType::from_lsblk("disk"), Some(DeviceType::Disk));
        assert_eq!(DeviceType::from_lsblk("mpath"), Some(DeviceType::Mpath));
        assert_eq!(DeviceType::from_lsblk("rom"), None);
    }
}
