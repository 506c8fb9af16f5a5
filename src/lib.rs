//! Local Storage Operator
//!
//! A Kubernetes operator that turns node-local block devices into
//! symlink-backed local persistent volumes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       Control Plane (operator)                       │
//! │  LocalVolume / LocalVolumeSet / LocalVolumeDiscovery reconcilers     │
//! │  storage classes, finalizers, status        storage-class index      │
//! │                 ┌──────────────────────────────┐                     │
//! │                 │   Node-Daemon Aggregator     │                     │
//! │                 │ local-provisioner config map │                     │
//! │                 │ diskmaker-manager daemon set │                     │
//! │                 └──────────────┬───────────────┘                     │
//! ├────────────────────────────────┼─────────────────────────────────────┤
//! │                      Diskmaker (every node)                          │
//! │   lsblk ─> filter ─> age gate ─> lock ─> symlink ─> PersistentVolume │
//! │   deleter: Released PV ─> wipe ─> unlink ─> delete                   │
//! │   discovery: lsblk + udev ─> LocalVolumeDiscoveryResult              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: reconcilers, owner index, node-daemon aggregator
//! - [`diskmaker`]: node-side provisioner, deleter and discovery loops
//! - [`hardware`]: block device enumeration, predicates, locks, symlinks
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: ports, well-known labels and event reasons
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod diskmaker;
pub mod domain;
pub mod error;
pub mod hardware;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use controlplane::{OperatorOptions, StorageClassOwnerIndex};

pub use crd::{
    LocalVolume, LocalVolumeSpec, LocalVolumeStatus,
    LocalVolumeSet, LocalVolumeSetSpec, LocalVolumeSetStatus,
    LocalVolumeDiscovery, LocalVolumeDiscoverySpec, LocalVolumeDiscoveryStatus,
    LocalVolumeDiscoveryResult, LocalVolumeDiscoveryResultSpec, LocalVolumeDiscoveryResultStatus,
    LogLevel, ManagementState, VolumeMode,
};

pub use diskmaker::{DiskmakerMetrics, NodeIdentity, RuntimeConfig};

pub use error::{Error, Result, ErrorAction};

pub use hardware::{BlockDevice, HostInspector, LsblkLister};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
