//! Storage-Class Owner Index
//!
//! Reverse index from storage class name to the custom resources that
//! declare it. Persistent-volume events carry a storage class even when
//! they predate the owner labels; the index turns that class back into
//! the owners to enqueue.

use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

/// Namespaced name of an owner resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    pub namespace: String,
    pub name: String,
}

impl OwnerKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl std::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Storage class name -> owners declaring it
#[derive(Debug, Default)]
pub struct StorageClassOwnerIndex {
    owners: Mutex<HashMap<String, BTreeSet<OwnerKey>>>,
}

impl StorageClassOwnerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop an owner from every storage class
    pub fn deregister_owner(&self, key: &OwnerKey) {
        let mut owners = self.owners.lock();
        owners.retain(|_, set| {
            set.remove(key);
            !set.is_empty()
        });
    }

    /// Make the owner's registrations exactly `storage_classes`
    pub fn sync_owner<'a>(&self, key: &OwnerKey, storage_classes: impl IntoIterator<Item = &'a str>) {
        let wanted: BTreeSet<&str> = storage_classes.into_iter().collect();
        let mut owners = self.owners.lock();
        owners.retain(|sc, set| {
            if !wanted.contains(sc.as_str()) {
                set.remove(key);
            }
            !set.is_empty()
        });
        for sc in wanted {
            owners.entry(sc.to_string()).or_default().insert(key.clone());
        }
    }

    /// Owners of a storage class, sorted
    pub fn owners(&self, storage_class: &str) -> Vec<OwnerKey> {
        self.owners
            .lock()
            .get(storage_class)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.owners.lock().is_empty()
    }
}
