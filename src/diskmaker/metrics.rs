//! Node Agent Metrics
//!
//! Prometheus gauges exported by the node agents on `/metrics`.

use crate::error::{Error, Result};
use prometheus::{IntGaugeVec, Opts, Registry};

/// Gauges exported by a node agent
#[derive(Clone)]
pub struct DiskmakerMetrics {
    registry: Registry,
    /// Devices in the last published discovery result
    pub discovery_disk_count: IntGaugeVec,
    /// Valid symlinks in a storage-class directory
    pub provisioned_pv_count: IntGaugeVec,
    /// Symlinks that no longer resolve to a listed device
    pub orphaned_symlinks: IntGaugeVec,
    /// Devices rejected by a LocalVolumeSet filter
    pub unmatched_disk_count: IntGaugeVec,
}

impl DiskmakerMetrics {
    /// Create the gauges on a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let discovery_disk_count = IntGaugeVec::new(
            Opts::new("lso_discovery_disk_count", "Number of disks discovered on the node"),
            &["node"],
        )
        .map_err(metrics_error)?;
        let provisioned_pv_count = IntGaugeVec::new(
            Opts::new("provisioned_pv_count", "Number of persistent volumes provisioned on the node"),
            &["node", "storageClass"],
        )
        .map_err(metrics_error)?;
        let orphaned_symlinks = IntGaugeVec::new(
            Opts::new("orphaned_symlinks", "Symlinks that do not point at a listed device"),
            &["node", "storageClass"],
        )
        .map_err(metrics_error)?;
        let unmatched_disk_count = IntGaugeVec::new(
            Opts::new("unmatched_disk_count", "Disks that did not match the LocalVolumeSet filter"),
            &["node", "storageClass"],
        )
        .map_err(metrics_error)?;

        for gauge in [
            &discovery_disk_count,
            &provisioned_pv_count,
            &orphaned_symlinks,
            &unmatched_disk_count,
        ] {
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
        }

        Ok(Self {
            registry,
            discovery_disk_count,
            provisioned_pv_count,
            orphaned_symlinks,
            unmatched_disk_count,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current value of a node/storage-class gauge, for status reporting and tests
    pub fn value(gauge: &IntGaugeVec, node: &str, storage_class: &str) -> i64 {
        gauge.with_label_values(&[node, storage_class]).get()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration: {}", e))
}
