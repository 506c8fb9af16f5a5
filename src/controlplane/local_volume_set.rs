//! LocalVolumeSet Reconciler
//!
//! Same lifecycle as the LocalVolume reconciler for a single storage
//! class, plus provisioned-volume accounting and detection of two sets
//! claiming the same storage class.

use crate::controlplane::common::{
    add_finalizer, daemonset_condition, decide_finalizer, ensure_storage_class, get_daemonset, owned_pvs,
    owner_of, patch_status, release_storage_classes, remove_finalizer, storage_class_pvs, Context,
    FinalizerDecision, DELETION_RETRY, DISKMAKER_MANAGER, RESYNC_INTERVAL,
};
use crate::controlplane::index::OwnerKey;
use crate::crd::{
    find_condition, set_condition, ConditionStatus, LocalVolumeSet, LocalVolumeSetStatus, OperatorCondition,
    CONDITION_AVAILABLE, CONDITION_DAEMONSETS_AVAILABLE,
};
use crate::domain::events::DELETION_FAILED;
use crate::domain::labels::OwnerKind;
use crate::domain::ports::OwnerEvent;
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Reconcile one LocalVolumeSet
#[instrument(skip_all, fields(lvset = %lvset.name_any(), namespace = %lvset.namespace().unwrap_or_default()))]
pub async fn reconcile(lvset: Arc<LocalVolumeSet>, ctx: Arc<Context>) -> Result<Action> {
    let ns = lvset
        .namespace()
        .ok_or_else(|| Error::MissingMetadata(lvset.name_any()))?;
    let api: Api<LocalVolumeSet> = Api::namespaced(ctx.client.clone(), &ns);
    let key = OwnerKey::of(lvset.as_ref());

    let Some(lvset) = api.get_opt(&lvset.name_any()).await? else {
        debug!("LocalVolumeSet {} is gone", key);
        ctx.lvset_index.deregister_owner(&key);
        ctx.nodedaemon.fire();
        return Ok(Action::await_change());
    };
    ctx.lvset_index
        .sync_owner(&key, [lvset.spec.storage_class_name.as_str()]);

    match apply_spec(&lvset, &api, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) => {
            let mut status = lvset.status.clone().unwrap_or_default();
            set_condition(
                &mut status.conditions,
                OperatorCondition::new(CONDITION_AVAILABLE, ConditionStatus::False, "ReconcileFailed", e.to_string()),
            );
            if let Err(patch_err) = patch_status(&api, &lvset.name_any(), &status).await {
                warn!("Could not record failure on {}: {}", key, patch_err);
            }
            Err(e)
        }
    }
}

async fn apply_spec(lvset: &LocalVolumeSet, api: &Api<LocalVolumeSet>, ctx: &Context) -> Result<Action> {
    let owner = owner_of(OwnerKind::LocalVolumeSet, lvset);
    let key = OwnerKey::of(lvset);
    let sc = lvset.spec.storage_class_name.clone();

    let owned = if lvset.meta().deletion_timestamp.is_some() {
        owned_pvs(&ctx.client, &owner).await?
    } else {
        Vec::new()
    };
    match decide_finalizer(lvset.meta(), &owned) {
        FinalizerDecision::Add => add_finalizer(api, lvset).await?,
        FinalizerDecision::Present => {}
        FinalizerDecision::Block { bound } => {
            let err = Error::DeletionBlocked {
                owner: key.to_string(),
                bound,
            };
            ctx.events
                .publish(&lvset.object_ref(&()), OwnerEvent::warning(DELETION_FAILED, err.to_string()))
                .await;
            warn!("{}", err);
            return Ok(Action::requeue(DELETION_RETRY));
        }
        FinalizerDecision::Release => {
            release_storage_classes(ctx, &owner, &[]).await?;
            ctx.lvset_index.deregister_owner(&key);
            remove_finalizer(api, lvset).await?;
            ctx.nodedaemon.fire();
            return Ok(Action::await_change());
        }
        FinalizerDecision::Gone => {
            ctx.lvset_index.deregister_owner(&key);
            return Ok(Action::await_change());
        }
    }

    ensure_storage_class(&ctx.client, &sc, &owner).await?;
    let removed = release_storage_classes(ctx, &owner, std::slice::from_ref(&sc)).await?;
    if !removed.is_empty() {
        info!("Removed storage classes no longer declared: {:?}", removed);
    }
    ctx.nodedaemon.fire();

    let siblings = api.list(&ListParams::default()).await?.items;
    let conflict = older_conflict(lvset, &siblings);
    let invalid = lvset.inclusion().size_bounds().err().map(|e| e.to_string());
    if let Some(reason) = &invalid {
        warn!("{} has an unusable device inclusion spec: {}", key, reason);
    }
    let ds = get_daemonset(&ctx.client, &ctx.namespace, DISKMAKER_MANAGER).await?;
    let provisioned = storage_class_pvs(&ctx.client, &sc).await?.len();

    let status = next_status(
        lvset,
        ds.as_ref(),
        Availability {
            conflict: conflict.as_deref(),
            invalid_spec: invalid.as_deref(),
        },
        provisioned,
    );
    if lvset.status.as_ref() != Some(&status) {
        patch_status(api, &lvset.name_any(), &status).await?;
    }
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Name of an older, available set holding the same storage class
///
/// Age is creation time, then name.
pub fn older_conflict(lvset: &LocalVolumeSet, siblings: &[LocalVolumeSet]) -> Option<String> {
    let mine = (lvset.metadata.creation_timestamp.as_ref().map(|t| t.0), lvset.name_any());
    siblings
        .iter()
        .filter(|other| other.name_any() != lvset.name_any())
        .filter(|other| other.spec.storage_class_name == lvset.spec.storage_class_name)
        .filter(|other| (other.metadata.creation_timestamp.as_ref().map(|t| t.0), other.name_any()) < mine)
        .filter(|other| {
            other
                .status
                .as_ref()
                .and_then(|s| find_condition(&s.conditions, CONDITION_AVAILABLE))
                .map_or(false, |c| c.status == ConditionStatus::True)
        })
        .map(|other| other.name_any())
        .min()
}

/// Problems that keep a set from being available
#[derive(Debug, Clone, Copy, Default)]
pub struct Availability<'a> {
    /// Older set holding the same storage class
    pub conflict: Option<&'a str>,
    /// Why the device inclusion spec cannot be applied
    pub invalid_spec: Option<&'a str>,
}

/// Status after a successful pass
pub fn next_status(
    lvset: &LocalVolumeSet,
    ds: Option<&DaemonSet>,
    availability: Availability<'_>,
    provisioned: usize,
) -> LocalVolumeSetStatus {
    let mut status = lvset.status.clone().unwrap_or_default();

    let (ds_status, ds_message) = daemonset_condition(ds);
    let reason = if ds_status == ConditionStatus::True {
        "DiskMakerAvailable"
    } else {
        "DiskMakerUnavailable"
    };
    set_condition(
        &mut status.conditions,
        OperatorCondition::new(CONDITION_DAEMONSETS_AVAILABLE, ds_status, reason, ds_message),
    );

    let available = match (availability.invalid_spec, availability.conflict) {
        (Some(reason), _) => OperatorCondition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            "InvalidDeviceInclusionSpec",
            reason,
        ),
        (None, Some(other)) => OperatorCondition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            "StorageClassConflict",
            format!(
                "storage class {} is already used by LocalVolumeSet {}",
                lvset.spec.storage_class_name, other
            ),
        ),
        (None, None) => OperatorCondition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::True,
            "Reconciled",
            "LocalVolumeSet is reconciled",
        ),
    };
    set_condition(&mut status.conditions, available);

    status.total_provisioned_device_count = Some(i32::try_from(provisioned).unwrap_or(i32::MAX));
    status.observed_generation = lvset.metadata.generation;
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::LocalVolumeSetSpec;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn lvset(name: &str, sc: &str, created_secs: i64, available: Option<ConditionStatus>) -> LocalVolumeSet {
        let mut set = LocalVolumeSet::new(
            name,
            LocalVolumeSetSpec {
                storage_class_name: sc.into(),
                ..Default::default()
            },
        );
        set.metadata.namespace = Some("lso".into());
        set.metadata.generation = Some(2);
        set.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap()));
        set.status = available.map(|status| LocalVolumeSetStatus {
            conditions: vec![OperatorCondition::new(CONDITION_AVAILABLE, status, "Reconciled", "")],
            ..Default::default()
        });
        set
    }

    #[test]
    fn test_older_available_set_wins() {
        let old = lvset("old", "fast", 100, Some(ConditionStatus::True));
        let young = lvset("young", "fast", 200, None);
        let all = vec![old.clone(), young.clone()];

        assert_eq!(older_conflict(&young, &all).as_deref(), Some("old"));
        assert_eq!(older_conflict(&old, &all), None);
    }

    #[test]
    fn test_unavailable_or_other_class_is_no_conflict() {
        let old_down = lvset("old", "fast", 100, Some(ConditionStatus::False));
        let old_other = lvset("other", "slow", 50, Some(ConditionStatus::True));
        let young = lvset("young", "fast", 200, None);
        let all = vec![old_down, old_other, young.clone()];
        assert_eq!(older_conflict(&young, &all), None);
    }

    #[test]
    fn test_same_age_breaks_tie_by_name() {
        let a = lvset("a", "fast", 100, Some(ConditionStatus::True));
        let b = lvset("b", "fast", 100, Some(ConditionStatus::True));
        let all = vec![a.clone(), b.clone()];
        assert_eq!(older_conflict(&b, &all).as_deref(), Some("a"));
        assert_eq!(older_conflict(&a, &all), None);
    }

    #[test]
    fn test_status_counts_and_conditions() {
        let set = lvset("fast-set", "fast", 100, None);
        let status = next_status(&set, None, Availability::default(), 3);

        assert_eq!(status.total_provisioned_device_count, Some(3));
        assert_eq!(status.observed_generation, Some(2));
        let ds = find_condition(&status.conditions, CONDITION_DAEMONSETS_AVAILABLE).unwrap();
        assert_eq!(ds.status, ConditionStatus::False);
        assert_eq!(ds.message.as_deref(), Some("DiskMaker: Not found"));
        assert_eq!(
            find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap().status,
            ConditionStatus::True
        );
    }

    #[test]
    fn test_conflict_reports_unavailable() {
        let set = lvset("young", "fast", 200, None);
        let status = next_status(
            &set,
            None,
            Availability {
                conflict: Some("old"),
                ..Default::default()
            },
            0,
        );
        let available = find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap();
        assert_eq!(available.status, ConditionStatus::False);
        assert!(available.message.as_deref().unwrap().contains("old"));
        assert_eq!(status.total_provisioned_device_count, Some(0));
    }

    #[test]
    fn test_invalid_inclusion_spec_reports_unavailable() {
        let mut set = lvset("fast-set", "fast", 100, None);
        set.spec.device_inclusion_spec = Some(crate::crd::DeviceInclusionSpec {
            max_size: Some(Quantity("ten gigs".into())),
            ..Default::default()
        });
        let invalid = set.inclusion().size_bounds().err().map(|e| e.to_string());
        assert!(invalid.is_some());

        let status = next_status(
            &set,
            None,
            Availability {
                conflict: Some("old"),
                invalid_spec: invalid.as_deref(),
            },
            0,
        );
        let available = find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap();
        assert_eq!(available.status, ConditionStatus::False);
        assert_eq!(available.reason.as_deref(), Some("InvalidDeviceInclusionSpec"));
        assert!(available.message.as_deref().unwrap().contains("maxSize"));
    }
}
