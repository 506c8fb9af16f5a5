//! Node-Daemon Aggregator
//!
//! Collapses every LocalVolume and LocalVolumeSet of the namespace into
//! one shared `local-provisioner` config map and one `diskmaker-manager`
//! daemon set. The config map content hash is stamped on the pod
//! template so any change rolls the node agents.
//!
//! The aggregator also retires workloads left behind by older operator
//! versions, once, and waits for their pods to go away.

use crate::controlplane::common::{Context, DISKMAKER_MANAGER, RESYNC_INTERVAL};
use crate::controlplane::{monitoring, network_policy};
use crate::crd::{LocalVolume, LocalVolumeSet, LogLevel, ManagementState};
use crate::diskmaker::runtime::{encode_config_data, MountConfig, StorageClassConfigs, PROVISIONER_CONFIGMAP};
use crate::domain::labels::{APP_LABEL, FIELD_MANAGER};
use crate::error::{kube_not_found, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, Container, ContainerPort, EnvVar, EnvVarSource, HostPathVolumeSource,
    NodeAffinity, NodeSelector, ObjectFieldSelector, Pod, PodSpec, PodTemplateSpec,
    SecretVolumeSource, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

// =============================================================================
// Constants
// =============================================================================

/// Pod-template annotation carrying the config map hash
pub const CONFIG_HASH_ANNOTATION: &str = "local.storage.openshift.io/configMapDataHash";

/// Secret holding the metrics proxy serving certificate
pub const METRICS_CERT_SECRET: &str = "diskmaker-metric-serving-cert";

/// Plain metrics port of the diskmaker container
pub const METRICS_PORT: i32 = 8383;

/// TLS port of the metrics proxy sidecar
pub const METRICS_PROXY_PORT: i32 = 9393;

/// Service account the node agents run as
pub const DISKMAKER_SERVICE_ACCOUNT: &str = "local-storage-admin";

/// `app` label prefixes of workloads from older operator versions
pub const LEGACY_APP_PREFIXES: &[&str] = &[
    "local-volume-diskmaker",
    "local-volume-provisioner",
    "localvolumeset-local-provisioner",
];

/// Upper bound of the wait for legacy pods
pub const LEGACY_BACKOFF_CAP: Duration = Duration::from_secs(120);

// =============================================================================
// Trigger
// =============================================================================

/// Wakes the aggregator; extra wakes while one is pending are dropped
#[derive(Clone)]
pub struct NodeDaemonTrigger(mpsc::Sender<()>);

impl NodeDaemonTrigger {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self(tx), rx)
    }

    pub fn fire(&self) {
        let _ = self.0.try_send(());
    }
}

// =============================================================================
// Aggregation
// =============================================================================

/// Everything the shared config map and daemon set are rendered from
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedSpec {
    pub storage_classes: StorageClassConfigs,
    pub tolerations: Vec<Toleration>,
    /// `None` schedules on every node
    pub node_selector: Option<NodeSelector>,
    pub owner_references: Vec<OwnerReference>,
    pub log_level: LogLevel,
}

struct Entry<'a> {
    namespace: String,
    name: String,
    storage_class: &'a str,
    config: MountConfig,
}

/// Aggregate owners into one spec; `None` when there is nothing to run
pub fn aggregate(lvs: &[LocalVolume], lvsets: &[LocalVolumeSet], symlink_root: &Path) -> Option<AggregatedSpec> {
    let lvs: Vec<&LocalVolume> = lvs
        .iter()
        .filter(|lv| lv.spec.management_state != ManagementState::Removed)
        .collect();
    if lvs.is_empty() && lvsets.is_empty() {
        return None;
    }

    let mut entries: Vec<Entry<'_>> = Vec::new();
    for lv in &lvs {
        for scd in &lv.spec.storage_class_devices {
            entries.push(Entry {
                namespace: lv.namespace().unwrap_or_default(),
                name: lv.name_any(),
                storage_class: &scd.storage_class_name,
                config: MountConfig::under(symlink_root, &scd.storage_class_name, scd.volume_mode, &scd.fs_type),
            });
        }
    }
    for set in lvsets {
        let sc = &set.spec.storage_class_name;
        entries.push(Entry {
            namespace: set.namespace().unwrap_or_default(),
            name: set.name_any(),
            storage_class: sc,
            config: MountConfig::under(symlink_root, sc, set.spec.volume_mode, &set.spec.fs_type),
        });
    }
    entries.sort_by(|a, b| {
        (&a.namespace, &a.name, a.storage_class).cmp(&(&b.namespace, &b.name, b.storage_class))
    });
    let storage_classes: StorageClassConfigs = entries
        .into_iter()
        .map(|e| (e.storage_class.to_string(), e.config))
        .collect();

    let mut owners: Vec<(String, String, OwnerReference)> = Vec::new();
    let mut tolerations: Vec<Toleration> = Vec::new();
    let mut selectors: Vec<Option<&NodeSelector>> = Vec::new();
    for lv in &lvs {
        if let Some(oref) = lv.controller_owner_ref(&()).map(|mut o| { o.controller = None; o }) {
            owners.push((lv.namespace().unwrap_or_default(), lv.name_any(), oref));
        }
        tolerations.extend(lv.spec.tolerations.iter().cloned());
        selectors.push(lv.spec.node_selector.as_ref());
    }
    for set in lvsets {
        if let Some(oref) = set.controller_owner_ref(&()).map(|mut o| { o.controller = None; o }) {
            owners.push((set.namespace().unwrap_or_default(), set.name_any(), oref));
        }
        tolerations.extend(set.spec.tolerations.iter().cloned());
        selectors.push(set.spec.node_selector.as_ref());
    }
    owners.sort_by(|a, b| (&a.0, &a.1, &a.2.kind).cmp(&(&b.0, &b.1, &b.2.kind)));

    Some(AggregatedSpec {
        storage_classes,
        tolerations: dedup(tolerations),
        node_selector: union_selectors(&selectors),
        owner_references: owners.into_iter().map(|(_, _, o)| o).collect(),
        log_level: lvs
            .iter()
            .map(|lv| lv.spec.log_level)
            .max()
            .unwrap_or_default(),
    })
}

/// OR together node selectors; any absent selector matches every node
pub fn union_selectors(selectors: &[Option<&NodeSelector>]) -> Option<NodeSelector> {
    let mut terms = Vec::new();
    for selector in selectors {
        let selector = (*selector)?;
        terms.extend(selector.node_selector_terms.iter().cloned());
    }
    Some(NodeSelector {
        node_selector_terms: dedup(terms),
    })
}

fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// SHA-256 of the serialized config map data, hex encoded
pub fn config_hash(data: &BTreeMap<String, String>) -> Result<String> {
    let bytes = serde_json::to_vec(data)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

// =============================================================================
// Object Builders
// =============================================================================

/// The shared provisioner config map
pub fn provisioner_config_map(
    namespace: &str,
    data: BTreeMap<String, String>,
    owner_references: &[OwnerReference],
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(PROVISIONER_CONFIGMAP.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some([(APP_LABEL.to_string(), PROVISIONER_CONFIGMAP.to_string())].into()),
            owner_references: Some(owner_references.to_vec()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Parameters of a diskmaker daemon set
#[derive(Debug, Clone)]
pub struct WorkloadParams<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub args: Vec<String>,
    pub image: &'a str,
    /// Metrics proxy image; no sidecar when `None`
    pub proxy_image: Option<&'a str>,
    pub symlink_root: &'a Path,
    pub log_level: LogLevel,
    pub tolerations: Vec<Toleration>,
    pub node_selector: Option<NodeSelector>,
    pub owner_references: Vec<OwnerReference>,
    pub annotations: BTreeMap<String, String>,
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: None,
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Render a node-agent daemon set
pub fn diskmaker_daemonset(params: WorkloadParams<'_>) -> DaemonSet {
    let labels: BTreeMap<String, String> = [(APP_LABEL.to_string(), params.name.to_string())].into();
    let root = params.symlink_root.display().to_string();

    let mut containers = vec![Container {
        name: "diskmaker".to_string(),
        image: Some(params.image.to_string()),
        args: Some(params.args.clone()),
        env: Some(vec![
            field_env("MY_NODE_NAME", "spec.nodeName"),
            field_env("WATCH_NAMESPACE", "metadata.namespace"),
            value_env("LOG_LEVEL", params.log_level.directive()),
            value_env("LOCAL_DISK_LOCATION", root.clone()),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: METRICS_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "local-disks".to_string(),
                mount_path: root.clone(),
                mount_propagation: Some("HostToContainer".to_string()),
                ..Default::default()
            },
            VolumeMount {
                name: "device-dir".to_string(),
                mount_path: "/dev".to_string(),
                mount_propagation: Some("HostToContainer".to_string()),
                ..Default::default()
            },
            VolumeMount {
                name: "run-udev".to_string(),
                mount_path: "/run/udev".to_string(),
                mount_propagation: Some("HostToContainer".to_string()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }];

    let mut volumes = vec![
        host_path_volume("local-disks", &root),
        host_path_volume("device-dir", "/dev"),
        host_path_volume("run-udev", "/run/udev"),
    ];

    if let Some(proxy_image) = params.proxy_image {
        containers.push(Container {
            name: "kube-rbac-proxy".to_string(),
            image: Some(proxy_image.to_string()),
            args: Some(vec![
                format!("--secure-listen-address=0.0.0.0:{}", METRICS_PROXY_PORT),
                format!("--upstream=http://127.0.0.1:{}/", METRICS_PORT),
                "--tls-cert-file=/etc/tls/private/tls.crt".to_string(),
                "--tls-private-key-file=/etc/tls/private/tls.key".to_string(),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("https-metrics".to_string()),
                container_port: METRICS_PROXY_PORT,
                ..Default::default()
            }]),
            volume_mounts: Some(vec![VolumeMount {
                name: "metrics-serving-cert".to_string(),
                mount_path: "/etc/tls/private".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "metrics-serving-cert".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(METRICS_CERT_SECRET.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let affinity = params.node_selector.map(|selector| Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    });

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(params.name.to_string()),
            namespace: Some(params.namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(params.annotations.clone()),
            owner_references: Some(params.owner_references),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(params.annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_pid: Some(true),
                    service_account_name: Some(DISKMAKER_SERVICE_ACCOUNT.to_string()),
                    containers,
                    volumes: Some(volumes),
                    tolerations: Some(params.tolerations),
                    affinity,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Server-side apply a typed object
pub async fn apply<K>(api: &Api<K>, name: &str, object: &K) -> Result<K>
where
    K: Resource + Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    let params = PatchParams::apply(FIELD_MANAGER).force();
    Ok(api.patch(name, &params, &Patch::Apply(object)).await?)
}

// =============================================================================
// Legacy Retirement
// =============================================================================

/// Whether an `app` label value belongs to a retired workload
pub fn is_legacy_app(value: &str) -> bool {
    LEGACY_APP_PREFIXES.iter().any(|p| value.starts_with(p))
}

fn legacy_app(labels: &BTreeMap<String, String>) -> bool {
    labels.get(APP_LABEL).map_or(false, |v| is_legacy_app(v))
}

/// One-shot removal of legacy workloads
pub struct LegacyRetirement {
    done: AtomicBool,
    backoff: Mutex<ExponentialBackoff>,
}

impl Default for LegacyRetirement {
    fn default() -> Self {
        Self {
            done: AtomicBool::new(false),
            backoff: Mutex::new(retirement_backoff()),
        }
    }
}

fn retirement_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(2),
        max_interval: LEGACY_BACKOFF_CAP,
        max_elapsed_time: None,
        ..Default::default()
    }
}

impl LegacyRetirement {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Delete legacy objects; returns when to look again if pods remain
    pub async fn run(&self, ctx: &Context) -> Result<Option<Duration>> {
        if self.is_done() {
            return Ok(None);
        }
        let client = &ctx.client;
        let ns = ctx.namespace.as_str();

        let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), ns);
        for ds in daemonsets.list(&ListParams::default()).await?.items {
            if legacy_app(ds.labels()) {
                let name = ds.name_any();
                match daemonsets.delete(&name, &DeleteParams::background()).await {
                    Ok(_) => info!("Deleted legacy daemon set {}", name),
                    Err(e) if kube_not_found(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        monitoring::delete_legacy_service_monitors(ctx).await?;

        let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
        let remaining = pods
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|p| legacy_app(p.labels()))
            .count();
        if remaining == 0 {
            info!("Legacy workloads retired");
            self.done.store(true, Ordering::Release);
            self.backoff.lock().reset();
            return Ok(None);
        }

        let wait = self.backoff.lock().next_backoff().unwrap_or(LEGACY_BACKOFF_CAP);
        debug!("{} legacy pods remain, checking again in {:?}", remaining, wait);
        Ok(Some(wait))
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// The namespace's node-daemon aggregator
pub struct NodeDaemon {
    ctx: Arc<Context>,
    retirement: LegacyRetirement,
}

impl NodeDaemon {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            retirement: LegacyRetirement::default(),
        }
    }

    /// One aggregation pass; returns an early requeue when one is needed
    #[instrument(skip_all, fields(namespace = %self.ctx.namespace))]
    pub async fn reconcile(&self) -> Result<Option<Duration>> {
        let ctx = &self.ctx;
        let ns = ctx.namespace.as_str();
        let lvs = Api::<LocalVolume>::namespaced(ctx.client.clone(), ns)
            .list(&ListParams::default())
            .await?
            .items;
        let lvsets = Api::<LocalVolumeSet>::namespaced(ctx.client.clone(), ns)
            .list(&ListParams::default())
            .await?
            .items;

        let Some(spec) = aggregate(&lvs, &lvsets, &ctx.options.symlink_root) else {
            debug!("No LocalVolumes or LocalVolumeSets, nothing to aggregate");
            return Ok(None);
        };

        let data = encode_config_data(&spec.storage_classes)?;
        let hash = config_hash(&data)?;
        let maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), ns);
        apply(
            &maps,
            PROVISIONER_CONFIGMAP,
            &provisioner_config_map(ns, data, &spec.owner_references),
        )
        .await?;

        let daemonsets: Api<DaemonSet> = Api::namespaced(ctx.client.clone(), ns);
        let ds = diskmaker_daemonset(WorkloadParams {
            name: DISKMAKER_MANAGER,
            namespace: ns,
            args: vec!["diskmaker".to_string(), "manager".to_string()],
            image: &ctx.options.diskmaker_image,
            proxy_image: Some(&ctx.options.rbac_proxy_image),
            symlink_root: &ctx.options.symlink_root,
            log_level: spec.log_level,
            tolerations: spec.tolerations.clone(),
            node_selector: spec.node_selector.clone(),
            owner_references: spec.owner_references.clone(),
            annotations: [(CONFIG_HASH_ANNOTATION.to_string(), hash.clone())].into(),
        });
        apply(&daemonsets, DISKMAKER_MANAGER, &ds).await?;
        info!(
            "Applied {} for {} storage classes (config {})",
            DISKMAKER_MANAGER,
            spec.storage_classes.len(),
            &hash[..12]
        );

        monitoring::reconcile(ctx, &spec.owner_references).await?;
        network_policy::reconcile(ctx).await?;

        self.retirement.run(ctx).await
    }
}

/// Run the aggregator until shutdown
///
/// Passes run on trigger, on changes to workloads and config maps carrying
/// an `app` label, and on a resync timer.
pub async fn run(node_daemon: NodeDaemon, mut triggers: mpsc::Receiver<()>, shutdown: CancellationToken) {
    let ctx = node_daemon.ctx.clone();
    let cfg = watcher::Config::default().labels(APP_LABEL);
    let ds_events = watcher(Api::<DaemonSet>::namespaced(ctx.client.clone(), &ctx.namespace), cfg.clone())
        .default_backoff()
        .touched_objects();
    let cm_events = watcher(Api::<ConfigMap>::namespaced(ctx.client.clone(), &ctx.namespace), cfg)
        .default_backoff()
        .touched_objects();
    let mut changes = futures::stream::select(ds_events.map(|_| ()), cm_events.map(|_| ())).boxed();

    let mut ticker = tokio::time::interval(RESYNC_INTERVAL);
    let mut retry: Option<Duration> = None;
    info!("Starting node-daemon aggregator");

    loop {
        let sleep = tokio::time::sleep(retry.unwrap_or(RESYNC_INTERVAL));
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Node-daemon aggregator stopped");
                return;
            }
            _ = ticker.tick() => {}
            _ = sleep, if retry.is_some() => {}
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    return;
                }
            }
            change = changes.next() => {
                if change.is_none() {
                    return;
                }
            }
        }
        while triggers.try_recv().is_ok() {}

        retry = match node_daemon.reconcile().await {
            Ok(next) => next,
            Err(e) => {
                error!("Node-daemon aggregation failed: {}", e);
                Some(Duration::from_secs(10))
            }
        };
        if let Some(next) = retry {
            debug!("Aggregator requeued in {:?}", next);
        }
    }
}
