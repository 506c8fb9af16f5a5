//! Shared Reconciler Machinery
//!
//! Context, finalizer decisions, storage-class sync, persistent-volume
//! queries and the PV -> owner mappers used by the LocalVolume,
//! LocalVolumeSet and discovery reconcilers.

use crate::controlplane::index::{OwnerKey, StorageClassOwnerIndex};
use crate::controlplane::manager::OperatorOptions;
use crate::controlplane::nodedaemon::NodeDaemonTrigger;
use crate::crd::{ConditionStatus, GenerationStatus};
use crate::diskmaker::pv::phase;
use crate::domain::labels::{
    owner_from_labels, owner_labels, owner_selector, OwnerKind, OwnerRef, FINALIZER, NO_PROVISIONER,
};
use crate::domain::ports::EventSinkRef;
use crate::error::{kube_not_found, Error, ErrorAction, Result};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the aggregated diskmaker workload
pub const DISKMAKER_MANAGER: &str = "diskmaker-manager";

/// Name of the discovery workload
pub const DISKMAKER_DISCOVERY: &str = "diskmaker-discovery";

/// Requeue interval of a settled owner
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue interval while deletion waits on volumes
pub const DELETION_RETRY: Duration = Duration::from_secs(30);

const PHASE_BOUND: &str = "Bound";
const PHASE_RELEASED: &str = "Released";

// =============================================================================
// Context
// =============================================================================

/// State shared by the control-plane reconcilers
pub struct Context {
    pub client: Client,
    pub namespace: String,
    pub options: OperatorOptions,
    pub lv_index: Arc<StorageClassOwnerIndex>,
    pub lvset_index: Arc<StorageClassOwnerIndex>,
    pub events: EventSinkRef,
    pub nodedaemon: NodeDaemonTrigger,
}

/// Map an error to the controller's requeue action
pub fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!("Reconciling {} failed: {}", obj.name_any(), error);
    match error.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(Duration::from_secs(60)),
        ErrorAction::RequeueAfter(d) => Action::requeue(d),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

// =============================================================================
// Finalizer
// =============================================================================

/// What a reconcile must do about the protection finalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerDecision {
    /// Live object without the finalizer
    Add,
    /// Live object, finalizer in place
    Present,
    /// Deleting, but volumes are still Bound or Released
    Block { bound: usize },
    /// Deleting and nothing is in use: clean up and release
    Release,
    /// Deleting and the finalizer is already gone
    Gone,
}

pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .map_or(false, |f| f.iter().any(|x| x == FINALIZER))
}

/// Whether a volume still protects its owner
pub fn is_in_use(pv: &PersistentVolume) -> bool {
    matches!(phase(pv), Some(PHASE_BOUND) | Some(PHASE_RELEASED))
}

/// Decide the finalizer step given the owner's volumes
pub fn decide_finalizer(meta: &ObjectMeta, owned: &[PersistentVolume]) -> FinalizerDecision {
    let present = has_finalizer(meta);
    if meta.deletion_timestamp.is_none() {
        return if present {
            FinalizerDecision::Present
        } else {
            FinalizerDecision::Add
        };
    }
    if !present {
        return FinalizerDecision::Gone;
    }
    match owned.iter().filter(|pv| is_in_use(pv)).count() {
        0 => FinalizerDecision::Release,
        bound => FinalizerDecision::Block { bound },
    }
}

/// Append the protection finalizer
///
/// The patch carries the resource version so a concurrent writer fails
/// it and the next reconcile retries.
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.meta().resource_version,
        }
    });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!("Added finalizer to {}", obj.name_any());
    Ok(())
}

/// Remove the protection finalizer
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let finalizers: Vec<String> = obj
        .meta()
        .finalizers
        .iter()
        .flatten()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.meta().resource_version,
        }
    });
    match api
        .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {}
        Err(e) if kube_not_found(&e) => {}
        Err(e) => return Err(e.into()),
    }
    info!("Removed finalizer from {}", obj.name_any());
    Ok(())
}

/// Merge-patch the status subresource
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&json!({ "status": status })))
        .await?;
    Ok(())
}

// =============================================================================
// Persistent Volumes
// =============================================================================

/// Persistent volumes carrying an owner's labels
pub async fn owned_pvs(client: &Client, owner: &OwnerRef) -> Result<Vec<PersistentVolume>> {
    let pvs: Api<PersistentVolume> = Api::all(client.clone());
    let selector = owner_selector(owner.kind, &owner.namespace, &owner.name);
    Ok(pvs.list(&ListParams::default().labels(&selector)).await?.items)
}

/// Persistent volumes of a storage class
pub async fn storage_class_pvs(client: &Client, storage_class: &str) -> Result<Vec<PersistentVolume>> {
    let pvs: Api<PersistentVolume> = Api::all(client.clone());
    Ok(pvs
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|pv| pv_storage_class(pv) == Some(storage_class))
        .collect())
}

pub fn pv_storage_class(pv: &PersistentVolume) -> Option<&str> {
    pv.spec.as_ref().and_then(|s| s.storage_class_name.as_deref())
}

/// Owner named by a PV's labels, when it is of the given kind
pub fn pv_owner_ref<K>(pv: &PersistentVolume, kind: OwnerKind) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let owner = owner_from_labels(pv.metadata.labels.as_ref()?)?;
    if owner.kind != kind {
        return None;
    }
    Some(ObjectRef::new(&owner.name).within(&owner.namespace))
}

/// Owners of one kind a PV event should wake
///
/// The owner labels name one owner directly; the storage class reaches
/// every owner that declares it, including for volumes created before
/// the labels existed.
pub fn owners_for_pv(pv: &PersistentVolume, kind: OwnerKind, index: &StorageClassOwnerIndex) -> Vec<OwnerKey> {
    let mut keys: Vec<OwnerKey> = Vec::new();
    if let Some(owner) = pv.metadata.labels.as_ref().and_then(owner_from_labels) {
        if owner.kind == kind {
            keys.push(OwnerKey::new(owner.namespace, owner.name));
        }
    }
    if let Some(sc) = pv_storage_class(pv) {
        for key in index.owners(sc) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

/// Controller mapper from PV events to owner references
pub fn pv_mapper<K>(
    index: Arc<StorageClassOwnerIndex>,
    kind: OwnerKind,
) -> impl Fn(PersistentVolume) -> Vec<ObjectRef<K>> + Send + Sync + 'static
where
    K: Resource<DynamicType = ()>,
{
    move |pv| {
        owners_for_pv(&pv, kind, &index)
            .into_iter()
            .map(|key| ObjectRef::new(&key.name).within(&key.namespace))
            .collect()
    }
}

// =============================================================================
// Storage Classes
// =============================================================================

/// Storage class object for an owner
pub fn desired_storage_class(name: &str, owner: &OwnerRef) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(owner_labels(owner.kind, &owner.namespace, &owner.name)),
            ..Default::default()
        },
        provisioner: NO_PROVISIONER.to_string(),
        reclaim_policy: Some("Delete".to_string()),
        volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
        ..Default::default()
    }
}

/// Whether the storage class is labeled as belonging to the owner
pub fn storage_class_owned_by(sc: &StorageClass, owner: &OwnerRef) -> bool {
    sc.metadata
        .labels
        .as_ref()
        .and_then(owner_from_labels)
        .map_or(false, |o| &o == owner)
}

/// Whether the owner may write its labels onto an existing class
///
/// An unlabeled class is adopted. A class labeled for another owner is
/// shared and keeps that owner's labels.
pub fn claims_storage_class(existing: &StorageClass, owner: &OwnerRef) -> bool {
    let unlabeled = existing
        .metadata
        .labels
        .as_ref()
        .and_then(owner_from_labels)
        .is_none();
    unlabeled || storage_class_owned_by(existing, owner)
}

/// Create the storage class, or re-assert it when the owner may claim it
pub async fn ensure_storage_class(client: &Client, name: &str, owner: &OwnerRef) -> Result<()> {
    let api: Api<StorageClass> = Api::all(client.clone());
    let desired = desired_storage_class(name, owner);

    match api.get_opt(name).await? {
        None => match api.create(&PostParams::default(), &desired).await {
            Ok(_) => info!("Created storage class {}", name),
            Err(e) if crate::error::kube_conflict(&e) => debug!("Storage class {} appeared concurrently", name),
            Err(e) => return Err(e.into()),
        },
        Some(existing) if claims_storage_class(&existing, owner) => {
            let patch = json!({ "metadata": { "labels": desired.metadata.labels } });
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Some(_) => debug!("Storage class {} belongs to another owner, sharing it", name),
    }
    Ok(())
}

/// Fate of one storage class labeled for an owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageClassRelease {
    /// Still declared by the owner
    Keep(String),
    /// Nobody declares it any more
    Delete(String),
    /// Another owner still declares it and takes over the labels
    Handover { name: String, to: OwnerRef },
}

/// Decide what happens to the classes labeled for an owner
///
/// `labeled` are the classes carrying the owner's labels, `keep` the
/// ones it still declares, and `successor` names another owner still
/// declaring a class.
pub fn plan_storage_class_release(
    labeled: &[String],
    keep: &[String],
    successor: impl Fn(&str) -> Option<OwnerRef>,
) -> Vec<StorageClassRelease> {
    labeled
        .iter()
        .map(|name| {
            if keep.contains(name) {
                StorageClassRelease::Keep(name.clone())
            } else if let Some(to) = successor(name) {
                StorageClassRelease::Handover {
                    name: name.clone(),
                    to,
                }
            } else {
                StorageClassRelease::Delete(name.clone())
            }
        })
        .collect()
}

/// First owner other than `leaving` registered for the class, LocalVolumes first
pub fn successor_owner(
    lv_index: &StorageClassOwnerIndex,
    lvset_index: &StorageClassOwnerIndex,
    storage_class: &str,
    leaving: &OwnerRef,
) -> Option<OwnerRef> {
    let as_owner = |kind: OwnerKind| {
        move |key: OwnerKey| OwnerRef {
            kind,
            namespace: key.namespace,
            name: key.name,
        }
    };
    lv_index
        .owners(storage_class)
        .into_iter()
        .map(as_owner(OwnerKind::LocalVolume))
        .chain(
            lvset_index
                .owners(storage_class)
                .into_iter()
                .map(as_owner(OwnerKind::LocalVolumeSet)),
        )
        .find(|owner| owner != leaving)
}

/// Let go of the owner's storage classes that are not in `keep`
///
/// A class another owner still declares is relabeled to that owner
/// instead of deleted. Returns the deleted classes.
pub async fn release_storage_classes(ctx: &Context, owner: &OwnerRef, keep: &[String]) -> Result<Vec<String>> {
    let api: Api<StorageClass> = Api::all(ctx.client.clone());
    let selector = owner_selector(owner.kind, &owner.namespace, &owner.name);
    let labeled: Vec<String> = api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .iter()
        .map(|sc| sc.name_any())
        .collect();

    let plan = plan_storage_class_release(&labeled, keep, |sc| {
        successor_owner(&ctx.lv_index, &ctx.lvset_index, sc, owner)
    });

    let mut deleted = Vec::new();
    for step in plan {
        match step {
            StorageClassRelease::Keep(_) => {}
            StorageClassRelease::Handover { name, to } => {
                let patch = json!({ "metadata": { "labels": owner_labels(to.kind, &to.namespace, &to.name) } });
                match api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)).await {
                    Ok(_) => info!("Storage class {} handed over to {} {}/{}", name, to.kind, to.namespace, to.name),
                    Err(e) if kube_not_found(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            StorageClassRelease::Delete(name) => match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    info!("Deleted storage class {}", name);
                    deleted.push(name);
                }
                Err(e) if kube_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            },
        }
    }
    Ok(deleted)
}

// =============================================================================
// Diskmaker Workload Status
// =============================================================================

/// Condition status and message describing the diskmaker workload
///
/// A missing workload reports False.
pub fn daemonset_condition(ds: Option<&DaemonSet>) -> (ConditionStatus, String) {
    let Some(ds) = ds else {
        return (ConditionStatus::False, "DiskMaker: Not found".to_string());
    };
    let status = ds.status.clone().unwrap_or_default();
    let unavailable = status.number_unavailable.unwrap_or(0);
    if unavailable > 0 {
        (
            ConditionStatus::False,
            format!(
                "DiskMaker: {}/{} Unavailable",
                unavailable, status.desired_number_scheduled
            ),
        )
    } else {
        (ConditionStatus::True, "DiskMaker: Available".to_string())
    }
}

/// Generation record of a workload
pub fn daemonset_generation(ds: &DaemonSet) -> GenerationStatus {
    GenerationStatus {
        group: "apps".to_string(),
        resource: "DaemonSet".to_string(),
        namespace: ds.namespace().unwrap_or_default(),
        name: ds.name_any(),
        last_generation: ds.metadata.generation.unwrap_or_default(),
    }
}

/// Fetch a daemon set, `None` when absent
pub async fn get_daemonset(client: &Client, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
    let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}

/// Owner identity of a custom resource
pub fn owner_of<K: ResourceExt>(kind: OwnerKind, obj: &K) -> OwnerRef {
    OwnerRef {
        kind,
        namespace: obj.namespace().unwrap_or_default(),
        name: obj.name_any(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::LocalVolumeSet;
    use k8s_openapi::api::apps::v1::DaemonSetStatus;
    use k8s_openapi::api::core::v1::{PersistentVolumeSpec, PersistentVolumeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pv(name: &str, phase: &str, sc: &str, owner: Option<&OwnerRef>) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: owner.map(|o| owner_labels(o.kind, &o.namespace, &o.name)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                storage_class_name: Some(sc.into()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
        }
    }

    fn set_owner(name: &str) -> OwnerRef {
        OwnerRef {
            kind: OwnerKind::LocalVolumeSet,
            namespace: "lso".into(),
            name: name.into(),
        }
    }

    fn deleting(with_finalizer: bool) -> ObjectMeta {
        ObjectMeta {
            name: Some("fast-set".into()),
            deletion_timestamp: Some(Time(chrono::Utc::now())),
            finalizers: with_finalizer.then(|| vec![FINALIZER.to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn test_finalizer_on_live_objects() {
        let fresh = ObjectMeta::default();
        assert_eq!(decide_finalizer(&fresh, &[]), FinalizerDecision::Add);

        let protected = ObjectMeta {
            finalizers: Some(vec![FINALIZER.to_string()]),
            ..Default::default()
        };
        assert_eq!(decide_finalizer(&protected, &[]), FinalizerDecision::Present);
    }

    #[test]
    fn test_deletion_blocked_until_volumes_are_free() {
        let owner = set_owner("fast-set");
        let meta = deleting(true);

        let in_use = vec![
            pv("pv-a", "Released", "fast", Some(&owner)),
            pv("pv-b", "Bound", "fast", Some(&owner)),
        ];
        assert_eq!(
            decide_finalizer(&meta, &in_use),
            FinalizerDecision::Block { bound: 2 }
        );

        let freed = vec![pv("pv-b", "Available", "fast", Some(&owner))];
        assert_eq!(decide_finalizer(&meta, &freed), FinalizerDecision::Release);
        assert_eq!(decide_finalizer(&meta, &[]), FinalizerDecision::Release);
        assert_eq!(decide_finalizer(&deleting(false), &in_use), FinalizerDecision::Gone);
    }

    #[test]
    fn test_pv_routes_to_every_owner_of_its_class() {
        let index = StorageClassOwnerIndex::new();
        let a = OwnerKey::new("lso", "set-a");
        let b = OwnerKey::new("lso", "set-b");
        index.sync_owner(&a, ["fast"]);
        index.sync_owner(&b, ["fast"]);

        let labeled = pv("pv-1", "Bound", "fast", Some(&set_owner("set-a")));
        assert_eq!(
            owners_for_pv(&labeled, OwnerKind::LocalVolumeSet, &index),
            vec![a.clone(), b.clone()]
        );

        let unlabeled = pv("pv-2", "Available", "fast", None);
        assert_eq!(
            owners_for_pv(&unlabeled, OwnerKind::LocalVolumeSet, &index),
            vec![a.clone(), b.clone()]
        );

        let refs = pv_mapper::<LocalVolumeSet>(Arc::new(index), OwnerKind::LocalVolumeSet)(labeled);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "set-a");
        assert_eq!(refs[0].namespace.as_deref(), Some("lso"));
    }

    #[test]
    fn test_pv_labels_of_other_kind_do_not_cross_route() {
        let index = StorageClassOwnerIndex::new();
        let lv_owner = OwnerRef {
            kind: OwnerKind::LocalVolume,
            namespace: "lso".into(),
            name: "disks".into(),
        };
        let p = pv("pv-1", "Bound", "slow", Some(&lv_owner));
        assert!(owners_for_pv(&p, OwnerKind::LocalVolumeSet, &index).is_empty());
        assert!(pv_owner_ref::<LocalVolumeSet>(&p, OwnerKind::LocalVolumeSet).is_none());
    }

    #[test]
    fn test_desired_storage_class_is_stable() {
        let owner = set_owner("fast-set");
        let a = desired_storage_class("fast", &owner);
        let b = desired_storage_class("fast", &owner);
        assert_eq!(a, b);
        assert_eq!(a.provisioner, NO_PROVISIONER);
        assert_eq!(a.reclaim_policy.as_deref(), Some("Delete"));
        assert_eq!(a.volume_binding_mode.as_deref(), Some("WaitForFirstConsumer"));
        assert!(storage_class_owned_by(&a, &owner));
        assert!(!storage_class_owned_by(&a, &set_owner("other")));
    }

    fn names(classes: &[&str]) -> Vec<String> {
        classes.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_release_keeps_declared_and_deletes_the_rest() {
        let plan = plan_storage_class_release(&names(&["fast", "slow"]), &names(&["fast"]), |_| None);
        assert_eq!(
            plan,
            vec![
                StorageClassRelease::Keep("fast".into()),
                StorageClassRelease::Delete("slow".into()),
            ]
        );

        let released = plan_storage_class_release(&names(&["fast", "slow"]), &[], |_| None);
        assert!(released
            .iter()
            .all(|step| matches!(step, StorageClassRelease::Delete(_))));
    }

    #[test]
    fn test_shared_class_is_handed_over_not_deleted() {
        let lvset_index = StorageClassOwnerIndex::new();
        let lv_index = StorageClassOwnerIndex::new();
        let a = set_owner("set-a");
        let b = set_owner("set-b");
        lvset_index.sync_owner(&OwnerKey::new("lso", "set-a"), ["fast"]);
        lvset_index.sync_owner(&OwnerKey::new("lso", "set-b"), ["fast"]);

        let plan = plan_storage_class_release(&names(&["fast"]), &[], |sc| {
            successor_owner(&lv_index, &lvset_index, sc, &a)
        });
        assert_eq!(
            plan,
            vec![StorageClassRelease::Handover {
                name: "fast".into(),
                to: b.clone(),
            }]
        );

        lvset_index.deregister_owner(&OwnerKey::new("lso", "set-a"));
        lvset_index.deregister_owner(&OwnerKey::new("lso", "set-b"));
        let last = plan_storage_class_release(&names(&["fast"]), &[], |sc| {
            successor_owner(&lv_index, &lvset_index, sc, &b)
        });
        assert_eq!(last, vec![StorageClassRelease::Delete("fast".into())]);
    }

    #[test]
    fn test_renamed_class_survives_for_other_owner() {
        let lv_index = StorageClassOwnerIndex::new();
        let lvset_index = StorageClassOwnerIndex::new();
        let disks = OwnerRef {
            kind: OwnerKind::LocalVolume,
            namespace: "lso".into(),
            name: "disks".into(),
        };
        lv_index.sync_owner(&OwnerKey::new("lso", "disks"), ["fast"]);
        lvset_index.sync_owner(&OwnerKey::new("lso", "set-b"), ["fast"]);
        lvset_index.sync_owner(&OwnerKey::new("lso", "set-a"), ["old"]);

        let plan = plan_storage_class_release(&names(&["old", "fast"]), &names(&["new"]), |sc| {
            successor_owner(&lv_index, &lvset_index, sc, &set_owner("set-a"))
        });
        assert_eq!(
            plan,
            vec![
                StorageClassRelease::Delete("old".into()),
                StorageClassRelease::Handover {
                    name: "fast".into(),
                    to: disks,
                },
            ]
        );
    }

    #[test]
    fn test_successor_ignores_departing_owner_of_other_kind() {
        let lv_index = StorageClassOwnerIndex::new();
        let lvset_index = StorageClassOwnerIndex::new();
        lv_index.sync_owner(&OwnerKey::new("lso", "shared-name"), ["fast"]);
        lvset_index.sync_owner(&OwnerKey::new("lso", "shared-name"), ["fast"]);

        let leaving = OwnerRef {
            kind: OwnerKind::LocalVolume,
            namespace: "lso".into(),
            name: "shared-name".into(),
        };
        assert_eq!(
            successor_owner(&lv_index, &lvset_index, "fast", &leaving),
            Some(set_owner("shared-name"))
        );
        assert_eq!(
            successor_owner(&lv_index, &lvset_index, "fast", &set_owner("shared-name")),
            Some(leaving)
        );
        assert_eq!(successor_owner(&lv_index, &lvset_index, "slow", &set_owner("x")), None);
    }

    #[test]
    fn test_shared_class_keeps_first_owner_labels() {
        let first = desired_storage_class("fast", &set_owner("set-a"));
        assert!(claims_storage_class(&first, &set_owner("set-a")));
        assert!(!claims_storage_class(&first, &set_owner("set-b")));

        let mut unlabeled = first.clone();
        unlabeled.metadata.labels = None;
        assert!(claims_storage_class(&unlabeled, &set_owner("set-b")));
    }

    #[test]
    fn test_daemonset_condition_messages() {
        assert_eq!(
            daemonset_condition(None),
            (ConditionStatus::False, "DiskMaker: Not found".to_string())
        );

        let mut ds = DaemonSet::default();
        ds.status = Some(DaemonSetStatus {
            desired_number_scheduled: 3,
            number_unavailable: Some(1),
            ..Default::default()
        });
        assert_eq!(
            daemonset_condition(Some(&ds)),
            (ConditionStatus::False, "DiskMaker: 1/3 Unavailable".to_string())
        );

        ds.status = Some(DaemonSetStatus {
            desired_number_scheduled: 3,
            number_available: Some(3),
            ..Default::default()
        });
        assert_eq!(
            daemonset_condition(Some(&ds)).0,
            ConditionStatus::True
        );
    }
}
