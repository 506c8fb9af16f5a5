//! Hardware Module
//!
//! Host-side device handling for the node agents: enumeration, host
//! predicates, filtering, age gating, per-device locking, and symlink
//! publishing.

pub mod age;
pub mod blockdev;
pub mod filter;
pub mod inspect;
pub mod lock;
pub mod symlink;

pub use age::DeviceAgeMap;
pub use blockdev::{BlockDevice, BlockListing, LsblkLister};
pub use filter::Verdict;
pub use inspect::{HostInspector, WipefsWiper};
pub use lock::{LockAcquisition, PvLock};
pub use symlink::{LinkEntry, PublishedLink};
