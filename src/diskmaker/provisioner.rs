//! On-Node Provisioner
//!
//! One provisioning pass for a LocalVolume or a LocalVolumeSet on the
//! local node. A pass enumerates devices, decides which ones belong to
//! the owner, and for each of them takes the PV-creation lock, publishes
//! the symlink and creates (or re-asserts) the persistent volume.
//!
//! Problems with a single device are reported as events on the owner and
//! never fail the pass. Only enumeration failures and unreadable symlink
//! directories do.

use crate::crd::{LocalVolume, LocalVolumeSet, VolumeMode};
use crate::diskmaker::metrics::DiskmakerMetrics;
use crate::diskmaker::pv::{self, LocalPvRequest, PvOutcome, DEFAULT_RECLAIM_POLICY};
use crate::diskmaker::runtime::RuntimeConfig;
use crate::domain::events;
use crate::domain::labels::{OwnerKind, OwnerRef};
use crate::domain::ports::{
    BlockListerRef, DeviceInspectorRef, EventSinkRef, OwnerEvent, ResolvedPath, VolumeApiRef,
};
use crate::domain::selector::node_selector_matches;
use crate::error::{Error, Result};
use crate::hardware::age::DeviceAgeMap;
use crate::hardware::blockdev::{BlockDevice, BlockListing};
use crate::hardware::filter::{self, Verdict};
use crate::hardware::lock;
use crate::hardware::symlink::{self, LinkEntry};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Settings
// =============================================================================

/// Timing of the provisioner loop
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Requeue interval of a settled pass
    pub check_duration: Duration,
    /// How long a LocalVolumeSet device must be present before it is used
    pub device_min_age: Duration,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            check_duration: Duration::from_secs(60),
            device_min_age: Duration::from_secs(60),
        }
    }
}

/// Capabilities the provisioner works through
#[derive(Clone)]
pub struct ProvisionerDeps {
    pub lister: BlockListerRef,
    pub inspector: DeviceInspectorRef,
    pub volumes: VolumeApiRef,
    pub events: EventSinkRef,
    pub metrics: Arc<DiskmakerMetrics>,
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// PVs created during the pass
    pub created: Vec<String>,
    /// PVs that already existed and were re-asserted
    pub asserted: Vec<String>,
    /// Devices held back by the age gate
    pub delayed: usize,
    /// Devices rejected by the LocalVolumeSet filter
    pub unmatched: usize,
    /// When the owner should be looked at again
    pub requeue_after: Duration,
}

/// A device chosen for an owner, with the name its symlink should get
#[derive(Debug, Clone)]
struct Candidate {
    device: BlockDevice,
    /// Path the symlink points at
    source: PathBuf,
    link_name: String,
    by_id: bool,
    /// Device path as written in a LocalVolume, announced once its PV exists
    requested: Option<String>,
}

/// Per-storage-class publishing parameters
struct Target<'a> {
    owner: &'a OwnerRef,
    regarding: &'a ObjectReference,
    storage_class: &'a str,
    volume_mode: VolumeMode,
    fs_type: &'a str,
    max_devices: Option<usize>,
}

// =============================================================================
// Provisioner
// =============================================================================

pub struct Provisioner {
    deps: ProvisionerDeps,
    settings: ProvisionerSettings,
    ages: DeviceAgeMap,
}

impl Provisioner {
    pub fn new(deps: ProvisionerDeps, settings: ProvisionerSettings) -> Self {
        Self {
            deps,
            settings,
            ages: DeviceAgeMap::new(),
        }
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    // -------------------------------------------------------------------------
    // LocalVolumeSet
    // -------------------------------------------------------------------------

    /// Provision every matching device for a LocalVolumeSet
    #[instrument(skip_all, fields(lvset = %lvset.name_any()))]
    pub async fn reconcile_set(
        &self,
        lvset: &LocalVolumeSet,
        runtime: &RuntimeConfig,
        now: Instant,
    ) -> Result<ProvisionReport> {
        let mut report = ProvisionReport {
            requeue_after: self.settings.check_duration,
            ..Default::default()
        };
        if !self.applies_to_node(lvset.meta(), lvset.spec.node_selector.as_ref(), runtime) {
            return Ok(report);
        }

        let inclusion = lvset.inclusion();
        if let Err(e) = inclusion.size_bounds() {
            warn!("Not provisioning for {}: {}", lvset.name_any(), e);
            return Err(e);
        }

        let owner = owner_ref(OwnerKind::LocalVolumeSet, lvset.meta());
        let regarding = lvset.object_ref(&());
        let listing = self.list_devices(&regarding).await?;

        let mut devices = listing.devices.clone();
        devices.sort_by(|a, b| a.kname.cmp(&b.kname));

        let mut candidates = Vec::new();
        for device in devices {
            match filter::evaluate(&device, &inclusion, self.deps.inspector.as_ref()) {
                Ok(Verdict::Accept) => {}
                Ok(Verdict::Reject(predicate)) => {
                    debug!("{} does not match: {}", device.kname, predicate);
                    report.unmatched += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Could not evaluate {}: {}", device.kname, e);
                    report.unmatched += 1;
                    continue;
                }
            }

            if !self.ages.is_old_enough(&device.kname, self.settings.device_min_age, now) {
                debug!("{} is younger than {:?}, delaying", device.kname, self.settings.device_min_age);
                report.delayed += 1;
                continue;
            }

            if let Some(candidate) = self.stable_candidate(&device, runtime, &regarding).await {
                candidates.push(candidate);
            }
        }

        let storage_class = lvset.spec.storage_class_name.as_str();
        let target = Target {
            owner: &owner,
            regarding: &regarding,
            storage_class,
            volume_mode: lvset.spec.volume_mode,
            fs_type: &lvset.spec.fs_type,
            max_devices: lvset.spec.max_device_count.map(|n| n.max(0) as usize),
        };
        self.publish_all(&target, candidates, runtime, &mut report).await?;
        self.record_metrics(storage_class, &listing, runtime, &regarding).await;
        self.deps
            .metrics
            .unmatched_disk_count
            .with_label_values(&[runtime.node.name.as_str(), storage_class])
            .set(report.unmatched as i64);

        if report.delayed > 0 {
            report.requeue_after = report.requeue_after.min(self.settings.device_min_age / 2);
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // LocalVolume
    // -------------------------------------------------------------------------

    /// Provision the devices a LocalVolume names explicitly
    #[instrument(skip_all, fields(lv = %lv.name_any()))]
    pub async fn reconcile_volume(&self, lv: &LocalVolume, runtime: &RuntimeConfig) -> Result<ProvisionReport> {
        let mut report = ProvisionReport {
            requeue_after: self.settings.check_duration,
            ..Default::default()
        };
        if !self.applies_to_node(lv.meta(), lv.spec.node_selector.as_ref(), runtime) {
            return Ok(report);
        }

        let owner = owner_ref(OwnerKind::LocalVolume, lv.meta());
        let regarding = lv.object_ref(&());
        let listing = self.list_devices(&regarding).await?;

        let mut usable = Vec::new();
        for device in &listing.devices {
            if device.has_children {
                continue;
            }
            match self.deps.inspector.has_bind_mounts(device) {
                Ok(false) => usable.push(device.clone()),
                Ok(true) => debug!("{} is bind mounted, ignoring", device.kname),
                Err(e) => warn!("Could not check bind mounts of {}: {}", device.kname, e),
            }
        }

        for scd in &lv.spec.storage_class_devices {
            let mut candidates = Vec::new();
            for raw in &scd.device_paths {
                if let Some(mut candidate) = self.resolve_device_path(Path::new(raw), &usable, runtime, &regarding).await {
                    candidate.requested = Some(raw.clone());
                    candidates.push(candidate);
                }
            }

            let target = Target {
                owner: &owner,
                regarding: &regarding,
                storage_class: &scd.storage_class_name,
                volume_mode: scd.volume_mode,
                fs_type: &scd.fs_type,
                max_devices: None,
            };
            self.publish_all(&target, candidates, runtime, &mut report).await?;
            self.record_metrics(&scd.storage_class_name, &listing, runtime, &regarding)
                .await;
        }

        Ok(report)
    }

    /// Map a user-supplied path to a listed device
    async fn resolve_device_path(
        &self,
        path: &Path,
        usable: &[BlockDevice],
        runtime: &RuntimeConfig,
        regarding: &ObjectReference,
    ) -> Option<Candidate> {
        let misconfigured = match self.deps.inspector.resolve(path) {
            Ok(ResolvedPath::Device { kname }) => match usable.iter().find(|d| d.kname == kname) {
                Some(device) if runtime.is_by_id_path(path) => {
                    return Some(Candidate {
                        device: device.clone(),
                        source: path.to_path_buf(),
                        link_name: file_name(path).unwrap_or(kname),
                        by_id: true,
                        requested: None,
                    });
                }
                Some(device) => {
                    let device = device.clone();
                    return self.stable_candidate(&device, runtime, regarding).await;
                }
                None => {
                    debug!("{} resolves to {} which is in use or has children", path.display(), kname);
                    return None;
                }
            },
            Ok(ResolvedPath::Missing) => Error::DevicePathMissing {
                path: path.display().to_string(),
            },
            Ok(ResolvedPath::Directory) => Error::DevicePathIsDirectory {
                path: path.display().to_string(),
            },
            Ok(ResolvedPath::RegularFile) => Error::DevicePathIsFile {
                path: path.display().to_string(),
            },
            Err(e) => e,
        };

        warn!("Skipping {}: {}", path.display(), misconfigured);
        self.deps
            .events
            .publish(
                regarding,
                OwnerEvent::warning(events::ERROR_FINDING_MATCHING_DISK, misconfigured.to_string()),
            )
            .await;
        None
    }

    /// Prefer the by-id path of a device, falling back to its kernel name
    async fn stable_candidate(
        &self,
        device: &BlockDevice,
        runtime: &RuntimeConfig,
        regarding: &ObjectReference,
    ) -> Option<Candidate> {
        match self.deps.inspector.path_by_id(device) {
            Ok(id_path) => Some(Candidate {
                device: device.clone(),
                link_name: file_name(&id_path).unwrap_or_else(|| device.kname.clone()),
                source: id_path,
                by_id: true,
                requested: None,
            }),
            Err(Error::IdPathNotFound { .. }) => Some(Candidate {
                device: device.clone(),
                source: runtime.device_node(&device.kname),
                link_name: device.kname.clone(),
                by_id: false,
                requested: None,
            }),
            Err(e) => {
                self.deps
                    .events
                    .publish(
                        regarding,
                        OwnerEvent::warning(
                            events::ERROR_LISTING_DEVICE_ID,
                            format!("failed to find by-id path for {}: {}", device.kname, e),
                        ),
                    )
                    .await;
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shared steps
    // -------------------------------------------------------------------------

    fn applies_to_node(
        &self,
        meta: &kube::api::ObjectMeta,
        selector: Option<&k8s_openapi::api::core::v1::NodeSelector>,
        runtime: &RuntimeConfig,
    ) -> bool {
        if meta.deletion_timestamp.is_some() {
            debug!("Owner is being deleted, skipping");
            return false;
        }
        if !node_selector_matches(selector, &runtime.node.name, &runtime.node.labels) {
            debug!("Node {} not selected, skipping", runtime.node.name);
            return false;
        }
        true
    }

    async fn list_devices(&self, regarding: &ObjectReference) -> Result<BlockListing> {
        match self.deps.lister.list().await {
            Ok(listing) => Ok(listing),
            Err(e) => {
                self.deps
                    .events
                    .publish(
                        regarding,
                        OwnerEvent::warning(events::ERROR_RUNNING_BLOCK_LIST, e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn existing_links(&self, dir: &Path, regarding: &ObjectReference) -> Result<Vec<LinkEntry>> {
        match symlink::list_links(dir) {
            Ok(links) => Ok(links),
            Err(e) => {
                self.deps
                    .events
                    .publish(
                        regarding,
                        OwnerEvent::warning(
                            events::ERROR_LISTING_EXISTING_SYMLINKS,
                            format!("error listing {}: {}", dir.display(), e),
                        ),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn publish_all(
        &self,
        target: &Target<'_>,
        candidates: Vec<Candidate>,
        runtime: &RuntimeConfig,
        report: &mut ProvisionReport,
    ) -> Result<()> {
        let dir = runtime.storage_class_dir(target.storage_class);
        let links = self.existing_links(&dir, target.regarding).await?;
        let mut linked: HashSet<PathBuf> = links.iter().filter_map(|l| l.target.clone()).collect();

        let reclaim_policy = match self.deps.volumes.storage_class_reclaim_policy(target.storage_class).await {
            Ok(Some(policy)) => policy,
            Ok(None) => DEFAULT_RECLAIM_POLICY.to_string(),
            Err(e) => {
                warn!("Could not read storage class {}: {}", target.storage_class, e);
                DEFAULT_RECLAIM_POLICY.to_string()
            }
        };

        for candidate in candidates {
            let node = runtime.device_node(&candidate.device.kname);
            let already_linked = std::fs::canonicalize(&node).map_or(false, |t| linked.contains(&t));
            if let Some(max) = target.max_devices {
                if !already_linked && linked.len() >= max {
                    info!(
                        "Reached max device count {} for {}, not claiming {}",
                        max, target.storage_class, candidate.device.kname
                    );
                    continue;
                }
            }

            match self
                .publish_one(target, &candidate, &node, &dir, &reclaim_policy, runtime)
                .await
            {
                Ok(Some((name, outcome))) => {
                    if let Ok(t) = std::fs::canonicalize(&node) {
                        linked.insert(t);
                    }
                    match outcome {
                        PvOutcome::Created => {
                            if let Some(raw) = &candidate.requested {
                                self.deps
                                    .events
                                    .publish(
                                        target.regarding,
                                        OwnerEvent::normal(
                                            events::FOUND_MATCHING_DISK,
                                            format!("found matching disk {} for {}", candidate.device.kname, raw),
                                        ),
                                    )
                                    .await;
                            }
                            report.created.push(name);
                        }
                        PvOutcome::Updated | PvOutcome::Unchanged => report.asserted.push(name),
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to provision {}: {}", candidate.device.kname, e),
            }
        }
        Ok(())
    }

    /// Lock, link and publish one device; `None` when the device was skipped
    async fn publish_one(
        &self,
        target: &Target<'_>,
        candidate: &Candidate,
        node: &Path,
        dir: &Path,
        reclaim_policy: &str,
        runtime: &RuntimeConfig,
    ) -> Result<Option<(String, PvOutcome)>> {
        let kname = &candidate.device.kname;
        let acquisition = match lock::acquire(&runtime.lock_dir, kname, node, &runtime.symlink_root) {
            Ok(acq) if acq.acquired() => acq,
            Ok(_) => {
                debug!("{} is locked by another loop, skipping", kname);
                return Ok(None);
            }
            Err(e) => {
                warn!("Could not lock {}: {}", kname, e);
                return Ok(None);
            }
        };

        let link = dir.join(&candidate.link_name);
        if !acquisition.existing_symlinks.is_empty() && !acquisition.existing_symlinks.contains(&link) {
            let existing: Vec<String> = acquisition
                .existing_symlinks
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            self.deps
                .events
                .publish(
                    target.regarding,
                    OwnerEvent::warning(
                        events::DEVICE_SYMLINK_EXISTS,
                        format!("{} is already linked at {}", kname, existing.join(", ")),
                    ),
                )
                .await;
            return Ok(None);
        }

        if let Err(e) = symlink::publish(&candidate.source, dir, &candidate.link_name) {
            self.deps
                .events
                .publish(
                    target.regarding,
                    OwnerEvent::warning(events::ERROR_CREATING_SYMLINK, e.to_string()),
                )
                .await;
            return Ok(None);
        }
        if !candidate.by_id {
            self.deps
                .events
                .publish(
                    target.regarding,
                    OwnerEvent::warning(
                        events::SYMLINKED_ON_DEVICE_NAME,
                        format!("{} has no by-id path; its name may change across reboots", kname),
                    ),
                )
                .await;
        }

        let desired = pv::build_pv(&LocalPvRequest {
            owner: target.owner,
            node_name: &runtime.node.name,
            provisioner_name: &runtime.provisioner_name,
            storage_class: target.storage_class,
            link: &link,
            capacity_bytes: candidate.device.size,
            volume_mode: target.volume_mode,
            fs_type: target.fs_type,
            reclaim_policy,
        });
        let name = desired.metadata.name.clone().unwrap_or_default();

        match pv::create_or_assert(self.deps.volumes.as_ref(), &desired).await {
            Ok(outcome) => Ok(Some((name, outcome))),
            Err(e) => {
                self.deps
                    .events
                    .publish(
                        target.regarding,
                        OwnerEvent::warning(
                            events::ERROR_PROVISIONING_DISK,
                            format!("error creating PV {} for {}: {}", name, kname, e),
                        ),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn record_metrics(
        &self,
        storage_class: &str,
        listing: &BlockListing,
        runtime: &RuntimeConfig,
        regarding: &ObjectReference,
    ) {
        let dir = runtime.storage_class_dir(storage_class);
        let Ok(links) = self.existing_links(&dir, regarding).await else {
            return;
        };

        let listed: HashSet<PathBuf> = listing
            .devices
            .iter()
            .filter_map(|d| std::fs::canonicalize(runtime.device_node(&d.kname)).ok())
            .collect();
        let provisioned = links.iter().filter(|l| l.target.is_some()).count();
        let orphaned = links
            .iter()
            .filter(|l| l.target.as_ref().map_or(true, |t| !listed.contains(t)))
            .count();

        let labels = [runtime.node.name.as_str(), storage_class];
        self.deps
            .metrics
            .provisioned_pv_count
            .with_label_values(&labels)
            .set(provisioned as i64);
        self.deps
            .metrics
            .orphaned_symlinks
            .with_label_values(&labels)
            .set(orphaned as i64);
    }
}

fn owner_ref(kind: OwnerKind, meta: &kube::api::ObjectMeta) -> OwnerRef {
    OwnerRef {
        kind,
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}
