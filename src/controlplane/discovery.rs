//! LocalVolumeDiscovery Reconciler
//!
//! Runs the `diskmaker-discovery` daemon set on the nodes the discovery
//! CR selects and reports its phase. Deleting the CR removes every
//! per-node result in the namespace before the finalizer is released.

use crate::controlplane::common::{
    add_finalizer, daemonset_condition, decide_finalizer, get_daemonset, patch_status, remove_finalizer,
    Context, FinalizerDecision, DISKMAKER_DISCOVERY, RESYNC_INTERVAL,
};
use crate::controlplane::nodedaemon::{apply, diskmaker_daemonset, WorkloadParams};
use crate::crd::{
    set_condition, ConditionStatus, DiscoveryPhase, LocalVolumeDiscovery, LocalVolumeDiscoveryResult,
    LocalVolumeDiscoveryStatus, LogLevel, OperatorCondition, CONDITION_AVAILABLE,
};
use crate::error::{kube_not_found, Error, Result};
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Reconcile one LocalVolumeDiscovery
#[instrument(skip_all, fields(discovery = %lvd.name_any(), namespace = %lvd.namespace().unwrap_or_default()))]
pub async fn reconcile(lvd: Arc<LocalVolumeDiscovery>, ctx: Arc<Context>) -> Result<Action> {
    let ns = lvd
        .namespace()
        .ok_or_else(|| Error::MissingMetadata(lvd.name_any()))?;
    let api: Api<LocalVolumeDiscovery> = Api::namespaced(ctx.client.clone(), &ns);
    let Some(lvd) = api.get_opt(&lvd.name_any()).await? else {
        return Ok(Action::await_change());
    };

    match decide_finalizer(lvd.meta(), &[]) {
        FinalizerDecision::Add => add_finalizer(&api, &lvd).await?,
        FinalizerDecision::Present => {}
        FinalizerDecision::Release | FinalizerDecision::Block { .. } => {
            let deleted = delete_results(&ctx, &ns).await?;
            info!("Deleted {} discovery results", deleted);
            remove_finalizer(&api, &lvd).await?;
            return Ok(Action::await_change());
        }
        FinalizerDecision::Gone => return Ok(Action::await_change()),
    }

    let daemonsets: Api<DaemonSet> = Api::namespaced(ctx.client.clone(), &ns);
    let ds = discovery_daemonset(&lvd, &ctx)?;
    apply(&daemonsets, DISKMAKER_DISCOVERY, &ds).await?;

    let current = get_daemonset(&ctx.client, &ns, DISKMAKER_DISCOVERY).await?;
    let status = next_status(&lvd, current.as_ref());
    if lvd.status.as_ref() != Some(&status) {
        patch_status(&api, &lvd.name_any(), &status).await?;
    }
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Discovery daemon set for a CR
pub fn discovery_daemonset(lvd: &LocalVolumeDiscovery, ctx: &Context) -> Result<DaemonSet> {
    let owner = lvd
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingMetadata(lvd.name_any()))?;
    let namespace = lvd.namespace().unwrap_or_default();
    Ok(diskmaker_daemonset(WorkloadParams {
        name: DISKMAKER_DISCOVERY,
        namespace: &namespace,
        args: vec!["diskmaker".to_string(), "discover".to_string()],
        image: &ctx.options.diskmaker_image,
        proxy_image: None,
        symlink_root: &ctx.options.symlink_root,
        log_level: LogLevel::Normal,
        tolerations: lvd.spec.tolerations.clone(),
        node_selector: lvd.spec.node_selector.clone(),
        owner_references: vec![owner],
        annotations: BTreeMap::new(),
    }))
}

async fn delete_results(ctx: &Context, namespace: &str) -> Result<usize> {
    let api: Api<LocalVolumeDiscoveryResult> = Api::namespaced(ctx.client.clone(), namespace);
    let mut deleted = 0;
    for result in api.list(&ListParams::default()).await?.items {
        match api.delete(&result.name_any(), &DeleteParams::default()).await {
            Ok(_) => deleted += 1,
            Err(e) if kube_not_found(&e) => debug!("Result {} already gone", result.name_any()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

/// Phase and conditions given the discovery workload
pub fn next_status(lvd: &LocalVolumeDiscovery, ds: Option<&DaemonSet>) -> LocalVolumeDiscoveryStatus {
    let mut status = lvd.status.clone().unwrap_or_default();
    status.phase = Some(if ds.is_some() {
        DiscoveryPhase::Discovering
    } else {
        DiscoveryPhase::DiscoveryFailed
    });

    let (available, message) = daemonset_condition(ds);
    let message = message.replacen("DiskMaker", "Discovery", 1);
    let reason = if available == ConditionStatus::True {
        "DiscoveryAvailable"
    } else {
        "DiscoveryUnavailable"
    };
    set_condition(
        &mut status.conditions,
        OperatorCondition::new(CONDITION_AVAILABLE, available, reason, message),
    );
    status.observed_generation = lvd.metadata.generation;
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{find_condition, LocalVolumeDiscoverySpec};
    use k8s_openapi::api::apps::v1::DaemonSetStatus;

    fn lvd() -> LocalVolumeDiscovery {
        let mut lvd = LocalVolumeDiscovery::new("auto-discover-devices", LocalVolumeDiscoverySpec::default());
        lvd.metadata.namespace = Some("lso".into());
        lvd.metadata.generation = Some(1);
        lvd
    }

    #[test]
    fn test_phase_follows_workload() {
        let failed = next_status(&lvd(), None);
        assert_eq!(failed.phase, Some(DiscoveryPhase::DiscoveryFailed));
        let cond = find_condition(&failed.conditions, CONDITION_AVAILABLE).unwrap();
        assert_eq!(cond.message.as_deref(), Some("Discovery: Not found"));

        let ds = DaemonSet {
            status: Some(DaemonSetStatus {
                desired_number_scheduled: 2,
                number_available: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        let running = next_status(&lvd(), Some(&ds));
        assert_eq!(running.phase, Some(DiscoveryPhase::Discovering));
        assert_eq!(running.observed_generation, Some(1));
        assert_eq!(
            find_condition(&running.conditions, CONDITION_AVAILABLE).unwrap().status,
            ConditionStatus::True
        );
    }
}
