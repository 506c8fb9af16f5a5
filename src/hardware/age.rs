//! Device Age Map
//!
//! Remembers when each device was first seen so that newly attached
//! devices are held back until they have been present for a minimum age.
//! Entries are never evicted; a restart simply re-delays every device.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// First-seen timestamps keyed by kernel name
#[derive(Debug, Default)]
pub struct DeviceAgeMap {
    first_seen: DashMap<String, Instant>,
}

impl DeviceAgeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the device if unseen and report whether it is at least `min_age` old
    pub fn is_old_enough(&self, kname: &str, min_age: Duration, now: Instant) -> bool {
        let seen = *self.first_seen.entry(kname.to_string()).or_insert(now);
        now.saturating_duration_since(seen) >= min_age
    }

    /// When the device was first seen, if ever
    #[cfg(test)]
    pub fn first_seen(&self, kname: &str) -> Option<Instant> {
        self.first_seen.get(kname).map(|seen| *seen)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.first_seen.len()
    }
}
