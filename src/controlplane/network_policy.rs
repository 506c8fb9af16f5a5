//! Network Policies
//!
//! Deny-by-default for the operator namespace, with egress to the API
//! server and cluster DNS, and ingress to the diskmaker metrics proxy.

use crate::controlplane::common::{Context, DISKMAKER_MANAGER};
use crate::controlplane::nodedaemon::{apply, METRICS_PROXY_PORT};
use crate::domain::labels::APP_LABEL;
use crate::error::Result;
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta};
use tracing::debug;

pub const DEFAULT_DENY_POLICY: &str = "local-storage-default-deny";
pub const API_SERVER_EGRESS_POLICY: &str = "local-storage-allow-api-server";
pub const DNS_EGRESS_POLICY: &str = "local-storage-allow-dns";
pub const METRICS_INGRESS_POLICY: &str = "local-storage-allow-metrics";

const API_SERVER_PORTS: &[i32] = &[6443, 443];
const DNS_PORTS: &[i32] = &[53, 5353];

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn ports(numbers: &[i32], protocols: &[&str]) -> Vec<NetworkPolicyPort> {
    let mut out = Vec::new();
    for protocol in protocols {
        for port in numbers {
            out.push(NetworkPolicyPort {
                port: Some(IntOrString::Int(*port)),
                protocol: Some(protocol.to_string()),
                end_port: None,
            });
        }
    }
    out
}

/// Every policy the namespace carries
pub fn desired_policies(namespace: &str) -> Vec<NetworkPolicy> {
    let all_pods = LabelSelector::default();
    vec![
        NetworkPolicy {
            metadata: meta(DEFAULT_DENY_POLICY, namespace),
            spec: Some(NetworkPolicySpec {
                pod_selector: all_pods.clone(),
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                ..Default::default()
            }),
        },
        NetworkPolicy {
            metadata: meta(API_SERVER_EGRESS_POLICY, namespace),
            spec: Some(NetworkPolicySpec {
                pod_selector: all_pods.clone(),
                egress: Some(vec![NetworkPolicyEgressRule {
                    ports: Some(ports(API_SERVER_PORTS, &["TCP"])),
                    to: None,
                }]),
                policy_types: Some(vec!["Egress".to_string()]),
                ..Default::default()
            }),
        },
        NetworkPolicy {
            metadata: meta(DNS_EGRESS_POLICY, namespace),
            spec: Some(NetworkPolicySpec {
                pod_selector: all_pods,
                egress: Some(vec![NetworkPolicyEgressRule {
                    ports: Some(ports(DNS_PORTS, &["TCP", "UDP"])),
                    to: None,
                }]),
                policy_types: Some(vec!["Egress".to_string()]),
                ..Default::default()
            }),
        },
        NetworkPolicy {
            metadata: meta(METRICS_INGRESS_POLICY, namespace),
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some([(APP_LABEL.to_string(), DISKMAKER_MANAGER.to_string())].into()),
                    ..Default::default()
                },
                ingress: Some(vec![NetworkPolicyIngressRule {
                    ports: Some(ports(&[METRICS_PROXY_PORT], &["TCP"])),
                    from: None,
                }]),
                policy_types: Some(vec!["Ingress".to_string()]),
                ..Default::default()
            }),
        },
    ]
}

/// Create or update the namespace's policies
pub async fn reconcile(ctx: &Context) -> Result<()> {
    let api: Api<NetworkPolicy> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    for policy in desired_policies(&ctx.namespace) {
        let name = policy.metadata.name.clone().unwrap_or_default();
        apply(&api, &name, &policy).await?;
    }
    debug!("Network policies applied in {}", ctx.namespace);
    Ok(())
}
