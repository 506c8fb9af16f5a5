//! Control Plane Module
//!
//! Reconcilers for the operator's custom resources and the namespace-wide
//! node-daemon aggregator:
//!
//! - `local_volume` / `local_volume_set` / `discovery`: per-kind reconcilers
//! - `index`: storage class -> owner reverse index for PV routing
//! - `nodedaemon`: shared config map and diskmaker daemon set
//! - `monitoring` / `network_policy`: metrics plumbing and namespace policies
//! - `manager`: wires everything onto one client

pub mod common;
pub mod discovery;
pub mod index;
pub mod local_volume;
pub mod local_volume_set;
pub mod manager;
pub mod monitoring;
pub mod network_policy;
pub mod nodedaemon;

pub use common::{Context, FinalizerDecision};
pub use index::{OwnerKey, StorageClassOwnerIndex};
pub use manager::{OperatorOptions, DEFAULT_DISKMAKER_IMAGE, DEFAULT_RBAC_PROXY_IMAGE};
pub use nodedaemon::{aggregate, AggregatedSpec, NodeDaemon, NodeDaemonTrigger};
