//! Node Agent Wiring
//!
//! Runs the node-side loops against the cluster: the provisioner
//! controller for LocalVolumes or LocalVolumeSets, the deleter driven by
//! a persistent-volume reflector and a tick, and the discovery agent.

use crate::controlplane::common::pv_owner_ref;
use crate::crd::{LocalVolume, LocalVolumeSet};
use crate::diskmaker::deleter::{force_wipe_classes, Deleter};
use crate::diskmaker::discovery::{spawn_uevent_monitor, DiscoveryAgent};
use crate::diskmaker::kube_api::{KubeDiscoveryResults, KubeEventSink, KubeVolumeApi};
use crate::diskmaker::metrics::DiskmakerMetrics;
use crate::diskmaker::provisioner::{Provisioner, ProvisionerDeps, ProvisionerSettings};
use crate::diskmaker::pv::provisioned_by;
use crate::diskmaker::runtime::{NodeIdentity, RuntimeConfig, PROVISIONER_CONFIGMAP};
use crate::domain::labels::OwnerKind;
use crate::domain::ports::{BlockLister, BlockListerRef, DeviceInspectorRef};
use crate::error::{Error, ErrorAction, Result};
use crate::hardware::{HostInspector, LsblkLister, WipefsWiper};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node, PersistentVolume};
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Reporter name of events published by node agents
pub const AGENT_REPORTER: &str = "local-storage-diskmaker";

/// Which owner kind a provisioner agent serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    LocalVolume,
    LocalVolumeSet,
}

/// Options of a node agent
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub namespace: String,
    pub node_name: String,
    pub symlink_root: PathBuf,
    pub lock_dir: PathBuf,
    pub settings: ProvisionerSettings,
    pub deleter_tick: Duration,
}

// =============================================================================
// Agent Context
// =============================================================================

/// Shared state of the provisioner and deleter loops on one node
pub struct AgentContext {
    client: Client,
    namespace: String,
    base_runtime: RuntimeConfig,
    provisioner: Provisioner,
    deleter: Deleter,
}

impl AgentContext {
    pub fn new(client: Client, options: &AgentOptions, node: NodeIdentity, metrics: Arc<DiskmakerMetrics>) -> Self {
        let volumes = Arc::new(KubeVolumeApi::new(client.clone()));
        let events = Arc::new(KubeEventSink::new(
            client.clone(),
            AGENT_REPORTER,
            Some(node.name.clone()),
        ));
        let lister: BlockListerRef = Arc::new(LsblkLister::default());
        let inspector: DeviceInspectorRef = Arc::new(HostInspector::default());

        let provisioner = Provisioner::new(
            ProvisionerDeps {
                lister,
                inspector,
                volumes: volumes.clone(),
                events,
                metrics,
            },
            options.settings.clone(),
        );
        let deleter = Deleter::new(volumes, Arc::new(WipefsWiper));
        let base_runtime = RuntimeConfig::new(node, &options.symlink_root).with_lock_dir(&options.lock_dir);

        Self {
            client,
            namespace: options.namespace.clone(),
            base_runtime,
            provisioner,
            deleter,
        }
    }

    /// Node runtime with the current node labels and shared provisioner config
    pub async fn runtime(&self) -> Result<RuntimeConfig> {
        let mut runtime = self.base_runtime.clone();

        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.get_opt(&runtime.node.name).await? {
            Some(node) => runtime.apply_node_labels(node.labels().clone()),
            None => warn!("Node {} not found, using labels from startup", runtime.node.name),
        }

        let maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        match maps.get_opt(PROVISIONER_CONFIGMAP).await? {
            Some(cm) => runtime.load_config_data(&cm.data.unwrap_or_default())?,
            None => debug!("Config map {} not found yet", PROVISIONER_CONFIGMAP),
        }
        Ok(runtime)
    }

    pub fn provisioner_name(&self) -> &str {
        &self.base_runtime.provisioner_name
    }
}

// =============================================================================
// Provisioner Controllers
// =============================================================================

#[instrument(skip_all, fields(lvset = %lvset.name_any()))]
async fn reconcile_lvset(lvset: Arc<LocalVolumeSet>, ctx: Arc<AgentContext>) -> Result<Action> {
    let runtime = ctx.runtime().await?;
    let report = ctx
        .provisioner
        .reconcile_set(&lvset, &runtime, Instant::now())
        .await?;
    if !report.created.is_empty() {
        info!("Created {} persistent volumes", report.created.len());
    }
    Ok(Action::requeue(report.requeue_after))
}

#[instrument(skip_all, fields(lv = %lv.name_any()))]
async fn reconcile_lv(lv: Arc<LocalVolume>, ctx: Arc<AgentContext>) -> Result<Action> {
    let runtime = ctx.runtime().await?;
    let report = ctx.provisioner.reconcile_volume(&lv, &runtime).await?;
    if !report.created.is_empty() {
        info!("Created {} persistent volumes", report.created.len());
    }
    Ok(Action::requeue(report.requeue_after))
}

fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, _ctx: Arc<AgentContext>) -> Action {
    warn!("Provisioning {} failed: {}", obj.name_any(), error);
    match error.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(Duration::from_secs(60)),
        ErrorAction::RequeueAfter(d) => Action::requeue(d),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Enqueue every owner in the store
fn all_owners<K>(store: &Store<K>) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store.state().iter().map(|o| ObjectRef::from_obj(o.as_ref())).collect()
}

/// Run the provisioner controller of the given flavor until shutdown
pub async fn run_provisioner(ctx: Arc<AgentContext>, flavor: Flavor) {
    let client = ctx.client.clone();
    let namespace = ctx.namespace.clone();
    let maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    let pvs: Api<PersistentVolume> = Api::all(client.clone());
    let map_cfg = watcher::Config::default().fields(&format!("metadata.name={}", PROVISIONER_CONFIGMAP));
    let nodes: Api<Node> = Api::all(client.clone());
    let node_cfg = watcher::Config::default().fields(&format!("metadata.name={}", ctx.base_runtime.node.name));
    let single = controller::Config::default().concurrency(1);
    let me = ctx.provisioner_name().to_string();

    match flavor {
        Flavor::LocalVolumeSet => {
            info!("Starting LocalVolumeSet provisioner");
            let controller = Controller::new(
                Api::<LocalVolumeSet>::namespaced(client, &namespace),
                watcher::Config::default(),
            );
            let store = controller.store();
            let relabeled = store.clone();
            controller
                .with_config(single)
                .watches(maps, map_cfg, move |_| all_owners(&store))
                .watches(nodes, node_cfg, move |_| all_owners(&relabeled))
                .watches(pvs, watcher::Config::default(), move |pv| {
                    if provisioned_by(&pv) != Some(me.as_str()) {
                        return None;
                    }
                    pv_owner_ref::<LocalVolumeSet>(&pv, OwnerKind::LocalVolumeSet)
                })
                .shutdown_on_signal()
                .run(reconcile_lvset, error_policy, ctx)
                .for_each(|res| async move {
                    match res {
                        Ok((obj, _)) => debug!("Provisioned {}", obj.name),
                        Err(e) => debug!("Provisioner controller error: {:?}", e),
                    }
                })
                .await;
        }
        Flavor::LocalVolume => {
            info!("Starting LocalVolume provisioner");
            let controller = Controller::new(
                Api::<LocalVolume>::namespaced(client, &namespace),
                watcher::Config::default(),
            );
            let store = controller.store();
            let relabeled = store.clone();
            controller
                .with_config(single)
                .watches(maps, map_cfg, move |_| all_owners(&store))
                .watches(nodes, node_cfg, move |_| all_owners(&relabeled))
                .watches(pvs, watcher::Config::default(), move |pv| {
                    if provisioned_by(&pv) != Some(me.as_str()) {
                        return None;
                    }
                    pv_owner_ref::<LocalVolume>(&pv, OwnerKind::LocalVolume)
                })
                .shutdown_on_signal()
                .run(reconcile_lv, error_policy, ctx)
                .for_each(|res| async move {
                    match res {
                        Ok((obj, _)) => debug!("Provisioned {}", obj.name),
                        Err(e) => debug!("Provisioner controller error: {:?}", e),
                    }
                })
                .await;
        }
    }
    info!("Provisioner stopped");
}

// =============================================================================
// Deleter Loop
// =============================================================================

/// Reclaim Released volumes on every tick and persistent-volume change
pub async fn run_deleter(ctx: Arc<AgentContext>, tick: Duration, shutdown: CancellationToken) {
    let (pv_store, pv_writer) = reflector::store::<PersistentVolume>();
    let pv_events = reflector(
        pv_writer,
        watcher(Api::<PersistentVolume>::all(ctx.client.clone()), watcher::Config::default()).default_backoff(),
    )
    .touched_objects();
    let (lv_store, lv_writer) = reflector::store::<LocalVolume>();
    let lv_events = reflector(
        lv_writer,
        watcher(
            Api::<LocalVolume>::namespaced(ctx.client.clone(), &ctx.namespace),
            watcher::Config::default(),
        )
        .default_backoff(),
    )
    .touched_objects();
    tokio::pin!(pv_events);
    tokio::pin!(lv_events);

    let mut ticker = tokio::time::interval(tick);
    info!("Starting deleter (tick {:?})", tick);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Deleter stopped");
                return;
            }
            _ = ticker.tick() => {}
            event = pv_events.next() => match event {
                Some(Ok(pv)) => {
                    if provisioned_by(&pv) != Some(ctx.provisioner_name()) {
                        continue;
                    }
                }
                Some(Err(e)) => {
                    warn!("PersistentVolume watch error: {}", e);
                    continue;
                }
                None => return,
            },
            event = lv_events.next() => match event {
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("LocalVolume watch error: {}", e);
                    continue;
                }
                None => return,
            },
        }

        let runtime = match ctx.runtime().await {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Cannot load provisioner config: {}", e);
                continue;
            }
        };
        let cached: Vec<PersistentVolume> = pv_store.state().iter().map(|pv| pv.as_ref().clone()).collect();
        let volumes = lv_store.state();
        let force_wipe = force_wipe_classes(volumes.iter().map(|lv| lv.as_ref()));

        let report = ctx.deleter.reclaim(&cached, &runtime, &force_wipe).await;
        if !report.deleted.is_empty() || !report.failed.is_empty() {
            info!(
                "Reclaim pass: {} deleted, {} failed",
                report.deleted.len(),
                report.failed.len()
            );
        }
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Options of the discovery agent
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub namespace: String,
    pub node_name: String,
    pub interval: Duration,
    pub uevent_window: Duration,
}

/// Run the discovery agent until shutdown
pub async fn run_discovery(
    client: Client,
    options: DiscoveryOptions,
    metrics: Arc<DiskmakerMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    let lister = Arc::new(LsblkLister::default());
    check_block_listing(lister.as_ref()).await?;

    let agent = Arc::new(DiscoveryAgent::new(
        options.node_name.clone(),
        lister,
        Arc::new(HostInspector::default()),
        Arc::new(KubeDiscoveryResults::new(client.clone(), &options.namespace)),
        Arc::new(KubeEventSink::new(client, AGENT_REPORTER, Some(options.node_name.clone()))),
        metrics,
    ));
    let uevents = spawn_uevent_monitor(options.uevent_window, shutdown.clone());
    info!("Starting discovery on {} every {:?}", options.node_name, options.interval);
    agent.run(options.interval, uevents, shutdown).await;
    Ok(())
}

/// Fail fast when the host cannot list block devices
///
/// The kubelet restarts an agent that exits here.
pub async fn check_block_listing(lister: &dyn BlockLister) -> Result<()> {
    let listing = lister.list().await?;
    info!("Found {} block devices at startup", listing.devices.len());
    Ok(())
}
