//! Metrics Service, Scrape Config and Alert Rules
//!
//! The diskmaker workload exposes its gauges through the TLS proxy
//! sidecar. This module installs the namespaced service in front of it,
//! a `ServiceMonitor` selecting that service, and the bundled
//! `PrometheusRule`. The monitoring types are optional: when their CRDs
//! are not installed the objects are skipped.

use crate::controlplane::common::{Context, DISKMAKER_MANAGER};
use crate::controlplane::nodedaemon::{apply, is_legacy_app, METRICS_CERT_SECRET, METRICS_PROXY_PORT};
use crate::domain::labels::{APP_LABEL, FIELD_MANAGER};
use crate::error::{kube_not_found, Result};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Service in front of the metrics proxy
pub const METRICS_SERVICE: &str = "local-storage-diskmaker-metrics";

/// Scrape config name
pub const SERVICE_MONITOR: &str = "local-storage-diskmaker-metrics";

/// Alert rules name
pub const PROMETHEUS_RULE: &str = "local-storage-alerts";

/// Annotation asking the cluster to mint the serving certificate
pub const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

fn service_monitor_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor"),
        "servicemonitors",
    )
}

fn prometheus_rule_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("monitoring.coreos.com", "v1", "PrometheusRule"),
        "prometheusrules",
    )
}

/// Namespaced API for ServiceMonitors
pub fn service_monitor_api(client: Client, namespace: &str) -> (Api<DynamicObject>, ApiResource) {
    let ar = service_monitor_resource();
    (Api::namespaced_with(client, namespace, &ar), ar)
}

fn selector_labels() -> BTreeMap<String, String> {
    [(APP_LABEL.to_string(), DISKMAKER_MANAGER.to_string())].into()
}

// =============================================================================
// Builders
// =============================================================================

/// Metrics service selecting the diskmaker pods
pub fn metrics_service(namespace: &str, owner_references: &[OwnerReference]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(METRICS_SERVICE.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector_labels()),
            annotations: Some([(SERVING_CERT_ANNOTATION.to_string(), METRICS_CERT_SECRET.to_string())].into()),
            owner_references: Some(owner_references.to_vec()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels()),
            ports: Some(vec![ServicePort {
                name: Some("https-metrics".to_string()),
                port: METRICS_PROXY_PORT,
                target_port: Some(IntOrString::Int(METRICS_PROXY_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ServiceMonitor scraping the metrics service over TLS
pub fn service_monitor(namespace: &str, owner_references: &[OwnerReference]) -> DynamicObject {
    let mut obj = DynamicObject::new(SERVICE_MONITOR, &service_monitor_resource())
        .within(namespace)
        .data(json!({
            "spec": {
                "namespaceSelector": { "matchNames": [namespace] },
                "selector": { "matchLabels": selector_labels() },
                "endpoints": [{
                    "port": "https-metrics",
                    "path": "/metrics",
                    "interval": "60s",
                    "scheme": "https",
                    "bearerTokenFile": "/var/run/secrets/kubernetes.io/serviceaccount/token",
                    "tlsConfig": {
                        "caFile": "/etc/prometheus/configmaps/serving-certs-ca-bundle/service-ca.crt",
                        "serverName": format!("{}.{}.svc", METRICS_SERVICE, namespace),
                    },
                }],
            }
        }));
    obj.metadata.labels = Some(selector_labels());
    obj.metadata.owner_references = Some(owner_references.to_vec());
    obj
}

/// Bundled alert rules
pub fn prometheus_rule(namespace: &str, owner_references: &[OwnerReference]) -> DynamicObject {
    let mut obj = DynamicObject::new(PROMETHEUS_RULE, &prometheus_rule_resource())
        .within(namespace)
        .data(json!({
            "spec": {
                "groups": [{
                    "name": "local-storage.rules",
                    "rules": [
                        {
                            "alert": "LocalStorageOrphanedSymlinks",
                            "expr": "max by (node, storageClass) (orphaned_symlinks) > 0",
                            "for": "30m",
                            "labels": { "severity": "warning" },
                            "annotations": {
                                "summary": "Symlinks without a backing device",
                                "description": "Node {{ $labels.node }} has symlinks in storage class {{ $labels.storageClass }} that do not point at a listed device.",
                            },
                        },
                        {
                            "alert": "LocalStorageUnmatchedDisks",
                            "expr": "max by (node, storageClass) (unmatched_disk_count) > 0",
                            "for": "1h",
                            "labels": { "severity": "info" },
                            "annotations": {
                                "summary": "Disks skipped by a LocalVolumeSet filter",
                                "description": "Node {{ $labels.node }} has disks that did not match the filter of storage class {{ $labels.storageClass }}.",
                            },
                        },
                    ],
                }],
            }
        }));
    obj.metadata.labels = Some(selector_labels());
    obj.metadata.owner_references = Some(owner_references.to_vec());
    obj
}

// =============================================================================
// Reconcile
// =============================================================================

async fn apply_optional(api: &Api<DynamicObject>, obj: &DynamicObject) -> Result<()> {
    let name = obj.name_any();
    let params = PatchParams::apply(FIELD_MANAGER).force();
    match api.patch(&name, &params, &Patch::Apply(obj)).await {
        Ok(_) => Ok(()),
        Err(e) if kube_not_found(&e) => {
            debug!("Monitoring API not installed, skipping {}", name);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Create or update the metrics service, scrape config and alert rules
pub async fn reconcile(ctx: &Context, owner_references: &[OwnerReference]) -> Result<()> {
    let ns = ctx.namespace.as_str();
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), ns);
    apply(&services, METRICS_SERVICE, &metrics_service(ns, owner_references)).await?;

    let (monitors, _) = service_monitor_api(ctx.client.clone(), ns);
    apply_optional(&monitors, &service_monitor(ns, owner_references)).await?;

    let rules: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), ns, &prometheus_rule_resource());
    apply_optional(&rules, &prometheus_rule(ns, owner_references)).await?;
    Ok(())
}

/// Delete ServiceMonitors left by older operator versions
pub async fn delete_legacy_service_monitors(ctx: &Context) -> Result<()> {
    let (api, _) = service_monitor_api(ctx.client.clone(), &ctx.namespace);
    let monitors = match api.list(&ListParams::default()).await {
        Ok(list) => list.items,
        Err(e) if kube_not_found(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for sm in monitors {
        let legacy = sm.labels().get(APP_LABEL).map_or(false, |v| is_legacy_app(v));
        if !legacy {
            continue;
        }
        let name = sm.name_any();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!("Deleted legacy service monitor {}", name),
            Err(e) if kube_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
