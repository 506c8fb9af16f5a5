//! LocalVolume Reconciler
//!
//! Keeps the storage classes of a LocalVolume in place, guards its
//! deletion while volumes are in use, and reports the shared diskmaker
//! workload's health on its status.

use crate::controlplane::common::{
    add_finalizer, daemonset_condition, daemonset_generation, decide_finalizer, ensure_storage_class,
    get_daemonset, owned_pvs, owner_of, patch_status, release_storage_classes, remove_finalizer,
    Context, FinalizerDecision, DELETION_RETRY, DISKMAKER_MANAGER, RESYNC_INTERVAL,
};
use crate::controlplane::index::OwnerKey;
use crate::crd::{
    set_condition, set_generation, ConditionStatus, LocalVolume, LocalVolumeStatus, ManagementState,
    OperatorCondition, CONDITION_AVAILABLE,
};
use crate::domain::events::DELETION_FAILED;
use crate::domain::labels::OwnerKind;
use crate::domain::ports::OwnerEvent;
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Reconcile one LocalVolume
#[instrument(skip_all, fields(lv = %lv.name_any(), namespace = %lv.namespace().unwrap_or_default()))]
pub async fn reconcile(lv: Arc<LocalVolume>, ctx: Arc<Context>) -> Result<Action> {
    let ns = lv
        .namespace()
        .ok_or_else(|| Error::MissingMetadata(lv.name_any()))?;
    let api: Api<LocalVolume> = Api::namespaced(ctx.client.clone(), &ns);
    let key = OwnerKey::of(lv.as_ref());

    let Some(lv) = api.get_opt(&lv.name_any()).await? else {
        debug!("LocalVolume {} is gone", key);
        ctx.lv_index.deregister_owner(&key);
        ctx.nodedaemon.fire();
        return Ok(Action::await_change());
    };
    if lv.spec.management_state == ManagementState::Removed {
        ctx.lv_index.deregister_owner(&key);
    } else {
        ctx.lv_index
            .sync_owner(&key, lv.spec.storage_class_devices.iter().map(|d| d.storage_class_name.as_str()));
    }

    match apply_spec(&lv, &api, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) => {
            let mut status = lv.status.clone().unwrap_or_default();
            set_condition(
                &mut status.conditions,
                OperatorCondition::new(CONDITION_AVAILABLE, ConditionStatus::False, "ReconcileFailed", e.to_string()),
            );
            if let Err(patch_err) = patch_status(&api, &lv.name_any(), &status).await {
                warn!("Could not record failure on {}: {}", key, patch_err);
            }
            Err(e)
        }
    }
}

async fn apply_spec(lv: &LocalVolume, api: &Api<LocalVolume>, ctx: &Context) -> Result<Action> {
    let owner = owner_of(OwnerKind::LocalVolume, lv);
    let key = OwnerKey::of(lv);
    let owned = if lv.meta().deletion_timestamp.is_some() {
        owned_pvs(&ctx.client, &owner).await?
    } else {
        Vec::new()
    };

    match decide_finalizer(lv.meta(), &owned) {
        FinalizerDecision::Add => add_finalizer(api, lv).await?,
        FinalizerDecision::Present => {}
        FinalizerDecision::Block { bound } => {
            let err = Error::DeletionBlocked {
                owner: key.to_string(),
                bound,
            };
            ctx.events
                .publish(&lv.object_ref(&()), OwnerEvent::warning(DELETION_FAILED, err.to_string()))
                .await;
            warn!("{}", err);
            return Ok(Action::requeue(DELETION_RETRY));
        }
        FinalizerDecision::Release => {
            release_storage_classes(ctx, &owner, &[]).await?;
            ctx.lv_index.deregister_owner(&key);
            remove_finalizer(api, lv).await?;
            ctx.nodedaemon.fire();
            return Ok(Action::await_change());
        }
        FinalizerDecision::Gone => {
            ctx.lv_index.deregister_owner(&key);
            return Ok(Action::await_change());
        }
    }

    let state = lv.spec.management_state;
    match state {
        ManagementState::Managed | ManagementState::Force => {
            let declared = lv.storage_class_names();
            for sc in &declared {
                ensure_storage_class(&ctx.client, sc, &owner).await?;
            }
            let removed = release_storage_classes(ctx, &owner, &declared).await?;
            if !removed.is_empty() {
                info!("Removed storage classes no longer declared: {:?}", removed);
            }
            ctx.nodedaemon.fire();
        }
        ManagementState::Removed => {
            release_storage_classes(ctx, &owner, &[]).await?;
            ctx.nodedaemon.fire();
        }
        ManagementState::Unmanaged => debug!("{} is unmanaged, refreshing status only", key),
    }

    let ds = get_daemonset(&ctx.client, &ctx.namespace, DISKMAKER_MANAGER).await?;
    let status = next_status(lv, ds.as_ref());
    if lv.status.as_ref() != Some(&status) {
        patch_status(api, &lv.name_any(), &status).await?;
    }
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Status after a successful pass
pub fn next_status(lv: &LocalVolume, ds: Option<&DaemonSet>) -> LocalVolumeStatus {
    let mut status = lv.status.clone().unwrap_or_default();
    let state = lv.spec.management_state;

    let condition = if state == ManagementState::Removed {
        OperatorCondition::new(CONDITION_AVAILABLE, ConditionStatus::False, "Removed", "LocalVolume is removed")
    } else {
        let (available, message) = daemonset_condition(ds);
        let reason = if available == ConditionStatus::True {
            "DiskMakerAvailable"
        } else {
            "DiskMakerUnavailable"
        };
        OperatorCondition::new(CONDITION_AVAILABLE, available, reason, message)
    };
    set_condition(&mut status.conditions, condition);

    if let Some(ds) = ds {
        set_generation(&mut status.generations, daemonset_generation(ds));
        status.ready_replicas = ds.status.as_ref().map_or(0, |s| s.number_ready);
    } else {
        status.ready_replicas = 0;
    }
    status.management_state = Some(state);
    status.observed_generation = lv.metadata.generation;
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{find_condition, LocalVolumeSpec, StorageClassDevice};
    use k8s_openapi::api::apps::v1::DaemonSetStatus;
    use kube::api::ObjectMeta;

    fn lv(state: ManagementState) -> LocalVolume {
        let mut lv = LocalVolume::new(
            "disks",
            LocalVolumeSpec {
                management_state: state,
                storage_class_devices: vec![StorageClassDevice {
                    storage_class_name: "slow".into(),
                    device_paths: vec!["/dev/sdb".into()],
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        lv.metadata.namespace = Some("lso".into());
        lv.metadata.generation = Some(4);
        lv
    }

    fn daemonset(ready: i32, unavailable: Option<i32>) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                name: Some(DISKMAKER_MANAGER.into()),
                namespace: Some("lso".into()),
                generation: Some(7),
                ..Default::default()
            },
            spec: None,
            status: Some(DaemonSetStatus {
                desired_number_scheduled: 3,
                number_ready: ready,
                number_unavailable: unavailable,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_status_tracks_workload() {
        let ds = daemonset(3, None);
        let status = next_status(&lv(ManagementState::Managed), Some(&ds));

        let available = find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap();
        assert_eq!(available.status, ConditionStatus::True);
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(status.observed_generation, Some(4));
        assert_eq!(status.generations.len(), 1);
        assert_eq!(status.generations[0].last_generation, 7);
        assert_eq!(status.management_state, Some(ManagementState::Managed));
    }

    #[test]
    fn test_status_without_workload() {
        let status = next_status(&lv(ManagementState::Managed), None);
        let available = find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap();
        assert_eq!(available.status, ConditionStatus::False);
        assert_eq!(available.message.as_deref(), Some("DiskMaker: Not found"));
        assert_eq!(status.ready_replicas, 0);
    }

    #[test]
    fn test_status_of_removed_volume() {
        let ds = daemonset(1, Some(2));
        let status = next_status(&lv(ManagementState::Removed), Some(&ds));
        let available = find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap();
        assert_eq!(available.status, ConditionStatus::False);
        assert_eq!(available.reason.as_deref(), Some("Removed"));
    }

    #[test]
    fn test_status_is_stable_across_passes() {
        let ds = daemonset(3, None);
        let mut volume = lv(ManagementState::Managed);
        let first = next_status(&volume, Some(&ds));
        volume.status = Some(first.clone());
        let second = next_status(&volume, Some(&ds));
        assert_eq!(
            find_condition(&first.conditions, CONDITION_AVAILABLE).unwrap().last_transition_time,
            find_condition(&second.conditions, CONDITION_AVAILABLE).unwrap().last_transition_time
        );
        assert_eq!(second.conditions.len(), 1);
    }
}
