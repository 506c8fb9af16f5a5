//! Well-known labels, annotations and names
//!
//! Owner labels tie a persistent volume or storage class back to the
//! custom resource that caused it to exist. They are a stable contract
//! for external tooling.

use std::collections::BTreeMap;

// =============================================================================
// Constants
// =============================================================================

/// Name of the owning custom resource
pub const OWNER_NAME_LABEL: &str = "local.storage.openshift.io/owner-name";

/// Namespace of the owning custom resource
pub const OWNER_NAMESPACE_LABEL: &str = "local.storage.openshift.io/owner-namespace";

/// Kind of the owning custom resource
pub const OWNER_KIND_LABEL: &str = "local.storage.openshift.io/owner-kind";

/// Annotation naming the node identity that provisioned a PV
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

/// Prefix of every node provisioner identity
pub const PROVISIONER_PREFIX: &str = "local-volume-provisioner";

/// Finalizer protecting owners while their volumes are in use
pub const FINALIZER: &str = "local-volume-protection";

/// Provisioner of every storage class the operator creates
pub const NO_PROVISIONER: &str = "kubernetes.io/no-provisioner";

/// Node hostname label
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Label carried by every workload the operator generates
pub const APP_LABEL: &str = "app";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "local-storage-operator";

// =============================================================================
// Owner Kind
// =============================================================================

/// Kinds that own persistent volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnerKind {
    LocalVolume,
    LocalVolumeSet,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::LocalVolume => "LocalVolume",
            OwnerKind::LocalVolumeSet => "LocalVolumeSet",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LocalVolume" => Some(OwnerKind::LocalVolume),
            "LocalVolumeSet" => Some(OwnerKind::LocalVolumeSet),
            _ => None,
        }
    }
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner identity as carried by the owner labels
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerRef {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
}

/// Owner labels for a resource
pub fn owner_labels(kind: OwnerKind, namespace: &str, name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(OWNER_KIND_LABEL.to_string(), kind.as_str().to_string());
    labels.insert(OWNER_NAMESPACE_LABEL.to_string(), namespace.to_string());
    labels.insert(OWNER_NAME_LABEL.to_string(), name.to_string());
    labels
}

/// Label selector string matching the owner labels
pub fn owner_selector(kind: OwnerKind, namespace: &str, name: &str) -> String {
    format!(
        "{}={},{}={},{}={}",
        OWNER_KIND_LABEL,
        kind.as_str(),
        OWNER_NAMESPACE_LABEL,
        namespace,
        OWNER_NAME_LABEL,
        name
    )
}

/// Read the owner back from a label map
pub fn owner_from_labels(labels: &BTreeMap<String, String>) -> Option<OwnerRef> {
    Some(OwnerRef {
        kind: OwnerKind::parse(labels.get(OWNER_KIND_LABEL)?)?,
        namespace: labels.get(OWNER_NAMESPACE_LABEL)?.clone(),
        name: labels.get(OWNER_NAME_LABEL)?.clone(),
    })
}

/// Provisioner identity of a node agent
pub fn provisioner_name(node_name: &str, node_uid: &str) -> String {
    format!("{}-{}-{}", PROVISIONER_PREFIX, node_name, node_uid)
}
