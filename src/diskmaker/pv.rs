//! Persistent Volume Generation
//!
//! Builds the local persistent volume for a published symlink and
//! creates or re-asserts it through the [`VolumeApi`] port.

use crate::crd::VolumeMode;
use crate::domain::labels::{owner_labels, OwnerRef, HOSTNAME_LABEL, PROVISIONED_BY_ANNOTATION};
use crate::domain::ports::VolumeApi;
use crate::domain::selector::hostname_selector;
use crate::error::Result;
use k8s_openapi::api::core::v1::{
    LocalVolumeSource, PersistentVolume, PersistentVolumeSpec, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Reclaim policy used when the storage class does not say
pub const DEFAULT_RECLAIM_POLICY: &str = "Delete";

/// Everything that goes into a local PV
#[derive(Debug, Clone)]
pub struct LocalPvRequest<'a> {
    pub owner: &'a OwnerRef,
    pub node_name: &'a str,
    pub provisioner_name: &'a str,
    pub storage_class: &'a str,
    /// Symlink the volume points at
    pub link: &'a Path,
    pub capacity_bytes: u64,
    pub volume_mode: VolumeMode,
    pub fs_type: &'a str,
    pub reclaim_policy: &'a str,
}

/// What [`create_or_assert`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvOutcome {
    Created,
    Updated,
    Unchanged,
}

/// `local-pv-<first 8 hex of sha256(link + node + storage class)>`
pub fn pv_name(link: &Path, node_name: &str, storage_class: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(link.to_string_lossy().as_bytes());
    hasher.update(node_name.as_bytes());
    hasher.update(storage_class.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("local-pv-{}", &digest[..8])
}

/// Build the PV object for a request
pub fn build_pv(req: &LocalPvRequest<'_>) -> PersistentVolume {
    let mut labels = owner_labels(req.owner.kind, &req.owner.namespace, &req.owner.name);
    labels.insert(HOSTNAME_LABEL.to_string(), req.node_name.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        PROVISIONED_BY_ANNOTATION.to_string(),
        req.provisioner_name.to_string(),
    );

    let fs_type = match req.volume_mode {
        VolumeMode::Filesystem if !req.fs_type.is_empty() => Some(req.fs_type.to_string()),
        _ => None,
    };

    let mut capacity = BTreeMap::new();
    capacity.insert("storage".to_string(), Quantity(req.capacity_bytes.to_string()));

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(pv_name(req.link, req.node_name, req.storage_class)),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(capacity),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            persistent_volume_reclaim_policy: Some(req.reclaim_policy.to_string()),
            storage_class_name: Some(req.storage_class.to_string()),
            volume_mode: Some(req.volume_mode.to_string()),
            local: Some(LocalVolumeSource {
                path: req.link.display().to_string(),
                fs_type,
            }),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(hostname_selector(req.node_name)),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create the PV, or make an existing one carry the expected labels and annotation
pub async fn create_or_assert(api: &dyn VolumeApi, desired: &PersistentVolume) -> Result<PvOutcome> {
    let name = desired.metadata.name.clone().unwrap_or_default();

    let existing = match api.get_pv(&name).await? {
        Some(existing) => existing,
        None => match api.create_pv(desired).await {
            Ok(_) => {
                info!("Created persistent volume {}", name);
                return Ok(PvOutcome::Created);
            }
            Err(e) if e.is_conflict() => match api.get_pv(&name).await? {
                Some(existing) => existing,
                None => return Err(e),
            },
            Err(e) => return Err(e),
        },
    };

    let mut merged = existing.clone();
    let changed = merge_map(&mut merged.metadata.labels, &desired.metadata.labels)
        | merge_map(&mut merged.metadata.annotations, &desired.metadata.annotations);
    if !changed {
        debug!("Persistent volume {} already up to date", name);
        return Ok(PvOutcome::Unchanged);
    }

    api.replace_pv(&merged).await?;
    info!("Updated labels of persistent volume {}", name);
    Ok(PvOutcome::Updated)
}

fn merge_map(
    target: &mut Option<BTreeMap<String, String>>,
    wanted: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(wanted) = wanted else {
        return false;
    };
    let target = target.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in wanted {
        if target.get(k) != Some(v) {
            target.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// Provisioner identity recorded on a PV
pub fn provisioned_by(pv: &PersistentVolume) -> Option<&str> {
    pv.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PROVISIONED_BY_ANNOTATION))
        .map(String::as_str)
}

/// Status phase of a PV
pub fn phase(pv: &PersistentVolume) -> Option<&str> {
    pv.status.as_ref().and_then(|s| s.phase.as_deref())
}
