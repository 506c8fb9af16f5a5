//! Diskmaker - On-Node Device Pipeline
//!
//! Everything that runs on a storage node:
//!
//! - `provisioner`: turns matching devices into symlinks and local PVs
//! - `deleter`: reclaims Released volumes provisioned by this node
//! - `discovery`: publishes the node's device inventory
//! - `runtime`: node identity and the shared provisioner config
//! - `pv`: persistent volume generation
//! - `metrics`: node gauges
//! - `kube_api` / `agent`: cluster-backed ports and loop wiring

pub mod agent;
pub mod deleter;
pub mod discovery;
pub mod kube_api;
pub mod metrics;
pub mod provisioner;
pub mod pv;
pub mod runtime;

pub use agent::{AgentContext, AgentOptions, DiscoveryOptions, Flavor};
pub use deleter::{Deleter, ReclaimReport};
pub use discovery::DiscoveryAgent;
pub use metrics::DiskmakerMetrics;
pub use provisioner::{ProvisionReport, Provisioner, ProvisionerDeps, ProvisionerSettings};
pub use runtime::{MountConfig, NodeIdentity, RuntimeConfig, StorageClassConfigs};
