//! Custom Resource Definitions for the Local Storage Operator
//!
//! This module contains all CRD types:
//! - LocalVolume: explicit device paths per storage class
//! - LocalVolumeSet: filter-selected devices for one storage class
//! - LocalVolumeDiscovery / LocalVolumeDiscoveryResult: per-node device inventory

pub mod common;
pub mod discovery;
pub mod local_volume;
pub mod local_volume_set;

pub use common::*;
pub use discovery::*;
pub use local_volume::*;
pub use local_volume_set::*;

use kube::CustomResourceExt;

/// Render every CRD manifest as a multi-document YAML string
pub fn render_crds() -> crate::error::Result<String> {
    let crds = [
        LocalVolume::crd(),
        LocalVolumeSet::crd(),
        LocalVolumeDiscovery::crd(),
        LocalVolumeDiscoveryResult::crd(),
    ];

    let mut out = String::new();
    for crd in crds.iter() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(crd)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_crds() {
        let yaml = render_crds().unwrap();
        assert_eq!(yaml.matches("---\n").count(), 4);
        assert!(yaml.contains("localvolumes.local.storage.openshift.io"));
        assert!(yaml.contains("localvolumediscoveryresults.local.storage.openshift.io"));
    }
}
