//! In-memory fakes of the domain ports, shared by unit tests

use crate::domain::ports::{
    BlockLister, DeviceInspector, DeviceWiper, EventSink, OwnerEvent, ResolvedPath, VolumeApi,
};
use crate::error::{Error, Result};
use crate::hardware::blockdev::{BlockDevice, BlockListing};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

// =============================================================================
// Block Lister
// =============================================================================

#[derive(Default)]
pub struct FakeLister {
    devices: Mutex<Vec<BlockDevice>>,
    failure: Mutex<Option<String>>,
}

impl FakeLister {
    pub fn new(devices: Vec<BlockDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            failure: Mutex::new(None),
        }
    }

    pub fn set_devices(&self, devices: Vec<BlockDevice>) {
        *self.devices.lock() = devices;
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }
}

#[async_trait]
impl BlockLister for FakeLister {
    async fn list(&self) -> Result<BlockListing> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(Error::BlockList(message));
        }
        Ok(BlockListing {
            devices: self.devices.lock().clone(),
            bad_rows: Vec::new(),
        })
    }
}

// =============================================================================
// Device Inspector
// =============================================================================

/// Answers host predicates from sets keyed by kernel name
#[derive(Default)]
pub struct FakeInspector {
    pub busy: HashSet<String>,
    pub bind_mounted: HashSet<String>,
    /// Devices whose predicates return an error
    pub failing: HashSet<String>,
    pub by_id: HashMap<String, PathBuf>,
    resolved: Mutex<HashMap<PathBuf, ResolvedPath>>,
}

impl FakeInspector {
    pub fn set_resolved(&self, path: &Path, resolved: ResolvedPath) {
        self.resolved.lock().insert(path.to_path_buf(), resolved);
    }

    fn check_failing(&self, device: &BlockDevice, predicate: &str) -> Result<()> {
        if self.failing.contains(&device.kname) {
            return Err(Error::DevicePredicate {
                predicate: predicate.to_string(),
                device: device.kname.clone(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl DeviceInspector for FakeInspector {
    fn can_open_exclusively(&self, device: &BlockDevice) -> Result<bool> {
        self.check_failing(device, "can-open-exclusively")?;
        Ok(!self.busy.contains(&device.kname))
    }

    fn has_bind_mounts(&self, device: &BlockDevice) -> Result<bool> {
        self.check_failing(device, "has-bind-mounts")?;
        Ok(self.bind_mounted.contains(&device.kname))
    }

    fn path_by_id(&self, device: &BlockDevice) -> Result<PathBuf> {
        self.by_id
            .get(&device.kname)
            .cloned()
            .ok_or_else(|| Error::IdPathNotFound {
                kname: device.kname.clone(),
            })
    }

    fn resolve(&self, path: &Path) -> Result<ResolvedPath> {
        Ok(self
            .resolved
            .lock()
            .get(path)
            .cloned()
            .unwrap_or(ResolvedPath::Missing))
    }
}

// =============================================================================
// Volume API
// =============================================================================

#[derive(Default)]
pub struct FakeVolumeApi {
    pvs: Mutex<BTreeMap<String, PersistentVolume>>,
    reclaim_policies: Mutex<HashMap<String, String>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeVolumeApi {
    pub fn insert(&self, pv: PersistentVolume) {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.pvs.lock().insert(name, pv);
    }

    pub fn all(&self) -> Vec<PersistentVolume> {
        self.pvs.lock().values().cloned().collect()
    }

    pub fn pv(&self, name: &str) -> Option<PersistentVolume> {
        self.pvs.lock().get(name).cloned()
    }

    pub fn update(&self, name: &str, f: impl FnOnce(&mut PersistentVolume)) {
        if let Some(pv) = self.pvs.lock().get_mut(name) {
            f(pv);
        }
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn set_reclaim_policy(&self, storage_class: &str, policy: &str) {
        self.reclaim_policies
            .lock()
            .insert(storage_class.to_string(), policy.to_string());
    }
}

#[async_trait]
impl VolumeApi for FakeVolumeApi {
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.pv(name))
    }

    async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = pv.metadata.name.clone().unwrap_or_default();
        let mut pvs = self.pvs.lock();
        if pvs.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "PersistentVolume".into(),
                name,
            });
        }
        pvs.insert(name, pv.clone());
        Ok(pv.clone())
    }

    async fn replace_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        self.insert(pv.clone());
        Ok(pv.clone())
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        self.pvs.lock().remove(name);
        self.deleted.lock().push(name.to_string());
        Ok(())
    }

    async fn storage_class_reclaim_policy(&self, name: &str) -> Result<Option<String>> {
        Ok(self.reclaim_policies.lock().get(name).cloned())
    }
}

// =============================================================================
// Event Sink
// =============================================================================

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(ObjectReference, OwnerEvent)>>,
}

impl RecordingEvents {
    pub fn recorded(&self) -> Vec<OwnerEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn reasons(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|(_, e)| e.reason).collect()
    }

    pub fn regarding(&self) -> Vec<ObjectReference> {
        self.events.lock().iter().map(|(r, _)| r.clone()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, regarding: &ObjectReference, event: OwnerEvent) {
        self.events.lock().push((regarding.clone(), event));
    }
}

// =============================================================================
// Device Wiper
// =============================================================================

#[derive(Default)]
pub struct RecordingWiper {
    wiped: Mutex<Vec<PathBuf>>,
}

impl RecordingWiper {
    pub fn wiped(&self) -> Vec<PathBuf> {
        self.wiped.lock().clone()
    }
}

#[async_trait]
impl DeviceWiper for RecordingWiper {
    async fn wipe(&self, device: &Path) -> Result<()> {
        self.wiped.lock().push(device.to_path_buf());
        Ok(())
    }
}

// =============================================================================
// Discovery Results
// =============================================================================

#[derive(Default)]
pub struct RecordingResults {
    published: Mutex<BTreeMap<String, Vec<crate::crd::DiscoveredDevice>>>,
    writes: Mutex<usize>,
}

impl RecordingResults {
    pub fn for_node(&self, node: &str) -> Option<Vec<crate::crd::DiscoveredDevice>> {
        self.published.lock().get(node).cloned()
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

#[async_trait]
impl crate::domain::ports::DiscoveryResults for RecordingResults {
    async fn upsert(
        &self,
        node_name: &str,
        devices: &[crate::crd::DiscoveredDevice],
        _discovered_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<ObjectReference> {
        self.published
            .lock()
            .insert(node_name.to_string(), devices.to_vec());
        *self.writes.lock() += 1;
        Ok(ObjectReference {
            kind: Some("LocalVolumeDiscoveryResult".into()),
            name: Some(crate::crd::discovery_result_name(node_name)),
            ..Default::default()
        })
    }
}
