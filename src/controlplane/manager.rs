//! Operator Manager
//!
//! Wires the LocalVolume, LocalVolumeSet and LocalVolumeDiscovery
//! controllers and the node-daemon aggregator onto one client and runs
//! them until shutdown.

use crate::controlplane::common::{error_policy, pv_mapper, Context};
use crate::controlplane::index::StorageClassOwnerIndex;
use crate::controlplane::nodedaemon::{self, NodeDaemon, NodeDaemonTrigger};
use crate::controlplane::{discovery, local_volume, local_volume_set};
use crate::crd::{LocalVolume, LocalVolumeDiscovery, LocalVolumeSet};
use crate::diskmaker::kube_api::KubeEventSink;
use crate::diskmaker::runtime::DEFAULT_SYMLINK_ROOT;
use crate::domain::labels::{OwnerKind, APP_LABEL};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::Api;
use kube::runtime::{watcher, Controller};
use kube::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default diskmaker image
pub const DEFAULT_DISKMAKER_IMAGE: &str = "quay.io/openshift/origin-local-storage-diskmaker:latest";

/// Default metrics proxy image
pub const DEFAULT_RBAC_PROXY_IMAGE: &str = "quay.io/openshift/origin-kube-rbac-proxy:latest";

/// Reporter name of operator events
pub const OPERATOR_REPORTER: &str = "local-storage-operator";

/// Operator-side settings
#[derive(Debug, Clone)]
pub struct OperatorOptions {
    pub diskmaker_image: String,
    pub rbac_proxy_image: String,
    pub symlink_root: PathBuf,
}

impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            diskmaker_image: DEFAULT_DISKMAKER_IMAGE.to_string(),
            rbac_proxy_image: DEFAULT_RBAC_PROXY_IMAGE.to_string(),
            symlink_root: PathBuf::from(DEFAULT_SYMLINK_ROOT),
        }
    }
}

/// Run every control-plane loop for a namespace
pub async fn run(client: Client, namespace: String, options: OperatorOptions, shutdown: CancellationToken) {
    let (trigger, triggers) = NodeDaemonTrigger::channel();
    let ctx = Arc::new(Context {
        client: client.clone(),
        namespace: namespace.clone(),
        options,
        lv_index: Arc::new(StorageClassOwnerIndex::new()),
        lvset_index: Arc::new(StorageClassOwnerIndex::new()),
        events: Arc::new(KubeEventSink::new(client.clone(), OPERATOR_REPORTER, None)),
        nodedaemon: trigger,
    });

    let daemonsets = || Api::<DaemonSet>::namespaced(client.clone(), &namespace);
    let pvs = || Api::<PersistentVolume>::all(client.clone());
    let workload_cfg = watcher::Config::default().labels(APP_LABEL);

    info!("Starting local storage operator in {}", namespace);

    let lv_controller = Controller::new(
        Api::<LocalVolume>::namespaced(client.clone(), &namespace),
        watcher::Config::default(),
    )
    .owns(daemonsets(), workload_cfg.clone())
    .watches(
        pvs(),
        watcher::Config::default(),
        pv_mapper::<LocalVolume>(ctx.lv_index.clone(), OwnerKind::LocalVolume),
    )
    .shutdown_on_signal()
    .run(local_volume::reconcile, error_policy, ctx.clone())
    .for_each(|res| async move {
        match res {
            Ok((obj, _)) => debug!("Reconciled LocalVolume {}", obj.name),
            Err(e) => debug!("LocalVolume controller error: {:?}", e),
        }
    });

    let lvset_controller = Controller::new(
        Api::<LocalVolumeSet>::namespaced(client.clone(), &namespace),
        watcher::Config::default(),
    )
    .owns(daemonsets(), workload_cfg.clone())
    .watches(
        pvs(),
        watcher::Config::default(),
        pv_mapper::<LocalVolumeSet>(ctx.lvset_index.clone(), OwnerKind::LocalVolumeSet),
    )
    .shutdown_on_signal()
    .run(local_volume_set::reconcile, error_policy, ctx.clone())
    .for_each(|res| async move {
        match res {
            Ok((obj, _)) => debug!("Reconciled LocalVolumeSet {}", obj.name),
            Err(e) => debug!("LocalVolumeSet controller error: {:?}", e),
        }
    });

    let discovery_controller = Controller::new(
        Api::<LocalVolumeDiscovery>::namespaced(client.clone(), &namespace),
        watcher::Config::default(),
    )
    .owns(daemonsets(), workload_cfg)
    .shutdown_on_signal()
    .run(discovery::reconcile, error_policy, ctx.clone())
    .for_each(|res| async move {
        match res {
            Ok((obj, _)) => debug!("Reconciled LocalVolumeDiscovery {}", obj.name),
            Err(e) => debug!("LocalVolumeDiscovery controller error: {:?}", e),
        }
    });

    let aggregator = nodedaemon::run(NodeDaemon::new(ctx.clone()), triggers, shutdown.clone());

    tokio::join!(lv_controller, lvset_controller, discovery_controller, aggregator);
    info!("Operator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = OperatorOptions::default();
        assert_eq!(options.diskmaker_image, DEFAULT_DISKMAKER_IMAGE);
        assert_eq!(options.rbac_proxy_image, DEFAULT_RBAC_PROXY_IMAGE);
        assert_eq!(options.symlink_root, PathBuf::from("/mnt/local-storage"));
    }
}
