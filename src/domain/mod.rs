//! Domain Module
//!
//! Ports (traits at the host and cluster seams), well-known labels and
//! event reasons, and node-selector matching shared by both the
//! control plane and the node agents.

pub mod events;
pub mod labels;
pub mod ports;
pub mod selector;

pub use labels::*;
pub use ports::*;
pub use selector::*;
