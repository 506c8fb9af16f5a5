//! Domain Ports - Core trait definitions for the operator
//!
//! These traits define the boundaries between the device pipeline and the
//! host or the cluster. Adapters implement them for real; tests plug in
//! in-memory fakes.

use crate::crd::DiscoveredDevice;
use crate::error::Result;
use crate::hardware::blockdev::{BlockDevice, BlockListing};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Block Lister Port
// =============================================================================

/// Port for enumerating block devices
#[async_trait]
pub trait BlockLister: Send + Sync {
    /// List every block device on the host
    async fn list(&self) -> Result<BlockListing>;
}

// =============================================================================
// Device Inspector Port
// =============================================================================

/// What a user-supplied device path points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    /// A block device with the given kernel name
    Device { kname: String },
    /// A regular file
    RegularFile,
    /// A directory
    Directory,
    /// Nothing exists at the path
    Missing,
}

/// Port for per-device host predicates
pub trait DeviceInspector: Send + Sync {
    /// Whether an exclusive open of the device node succeeds
    fn can_open_exclusively(&self, device: &BlockDevice) -> Result<bool>;

    /// Whether the device is bind mounted anywhere
    fn has_bind_mounts(&self, device: &BlockDevice) -> Result<bool>;

    /// First /dev/disk/by-id entry resolving to the device
    fn path_by_id(&self, device: &BlockDevice) -> Result<PathBuf>;

    /// Resolve a user-supplied path following symlinks
    fn resolve(&self, path: &Path) -> Result<ResolvedPath>;
}

// =============================================================================
// Volume API Port
// =============================================================================

/// Port for the persistent-volume operations a node agent performs
#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>>;

    async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;

    async fn replace_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;

    async fn delete_pv(&self, name: &str) -> Result<()>;

    /// Reclaim policy of a storage class, `None` if the class does not exist
    async fn storage_class_reclaim_policy(&self, name: &str) -> Result<Option<String>>;
}

// =============================================================================
// Event Sink Port
// =============================================================================

/// Severity of an emitted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// An event about an owner resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerEvent {
    pub severity: EventSeverity,
    pub reason: &'static str,
    pub message: String,
}

impl OwnerEvent {
    pub fn normal(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason,
            message: message.into(),
        }
    }

    pub fn warning(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason,
            message: message.into(),
        }
    }
}

/// Port for publishing events on owner resources
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event; failures are logged, never propagated
    async fn publish(&self, regarding: &ObjectReference, event: OwnerEvent);
}

// =============================================================================
// Device Wiper Port
// =============================================================================

/// Port for destroying data on a reclaimed device
#[async_trait]
pub trait DeviceWiper: Send + Sync {
    async fn wipe(&self, device: &Path) -> Result<()>;
}

// =============================================================================
// Discovery Results Port
// =============================================================================

/// Port for the per-node discovery result object
#[async_trait]
pub trait DiscoveryResults: Send + Sync {
    /// Create or update the node's result; returns a reference to it for events
    async fn upsert(
        &self,
        node_name: &str,
        devices: &[DiscoveredDevice],
        discovered_at: DateTime<Utc>,
    ) -> Result<ObjectReference>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type BlockListerRef = Arc<dyn BlockLister>;
pub type DeviceInspectorRef = Arc<dyn DeviceInspector>;
pub type VolumeApiRef = Arc<dyn VolumeApi>;
pub type EventSinkRef = Arc<dyn EventSink>;
pub type DeviceWiperRef = Arc<dyn DeviceWiper>;
pub type DiscoveryResultsRef = Arc<dyn DiscoveryResults>;
