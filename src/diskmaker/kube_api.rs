//! Kubernetes-backed Ports
//!
//! Implementations of the node-side ports against the API server:
//! persistent volumes and storage classes, events through the kube
//! [`Recorder`], the per-node discovery result object, and the node
//! identity lookup.

use crate::crd::{
    discovery_result_name, DiscoveredDevice, LocalVolumeDiscovery, LocalVolumeDiscoveryResult,
    LocalVolumeDiscoveryResultSpec, LocalVolumeDiscoveryResultStatus,
};
use crate::diskmaker::runtime::NodeIdentity;
use crate::domain::labels::{FIELD_MANAGER, HOSTNAME_LABEL};
use crate::domain::ports::{DiscoveryResults, EventSeverity, EventSink, OwnerEvent, VolumeApi};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, ObjectReference, PersistentVolume};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, warn};

// =============================================================================
// Volume API
// =============================================================================

/// Persistent volumes and storage classes through the API server
#[derive(Clone)]
pub struct KubeVolumeApi {
    pvs: Api<PersistentVolume>,
    storage_classes: Api<StorageClass>,
}

impl KubeVolumeApi {
    pub fn new(client: Client) -> Self {
        Self {
            pvs: Api::all(client.clone()),
            storage_classes: Api::all(client),
        }
    }
}

#[async_trait]
impl VolumeApi for KubeVolumeApi {
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.pvs.get_opt(name).await?)
    }

    async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        Ok(self.pvs.create(&PostParams::default(), pv).await?)
    }

    async fn replace_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = pv
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::MissingMetadata("PersistentVolume".into()))?;
        Ok(self.pvs.replace(&name, &PostParams::default(), pv).await?)
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        match self.pvs.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if crate::error::kube_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn storage_class_reclaim_policy(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .storage_classes
            .get_opt(name)
            .await?
            .and_then(|sc| sc.reclaim_policy))
    }
}

// =============================================================================
// Event Sink
// =============================================================================

/// Publishes events through the kube event recorder
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance,
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, regarding: &ObjectReference, event: OwnerEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let result = recorder
            .publish(Event {
                type_,
                reason: event.reason.to_string(),
                note: Some(event.message.clone()),
                action: "Provisioning".into(),
                secondary: None,
            })
            .await;
        if let Err(e) = result {
            warn!("Failed to publish event {}: {}", event.reason, e);
        }
    }
}

// =============================================================================
// Discovery Results
// =============================================================================

/// Writes LocalVolumeDiscoveryResult objects owned by the namespace's discovery CR
#[derive(Clone)]
pub struct KubeDiscoveryResults {
    results: Api<LocalVolumeDiscoveryResult>,
    discoveries: Api<LocalVolumeDiscovery>,
}

impl KubeDiscoveryResults {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            results: Api::namespaced(client.clone(), namespace),
            discoveries: Api::namespaced(client, namespace),
        }
    }

    async fn owner(&self) -> Result<Option<LocalVolumeDiscovery>> {
        let list = self.discoveries.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().find(|d| d.meta().deletion_timestamp.is_none()))
    }
}

#[async_trait]
impl DiscoveryResults for KubeDiscoveryResults {
    async fn upsert(
        &self,
        node_name: &str,
        devices: &[DiscoveredDevice],
        discovered_at: DateTime<Utc>,
    ) -> Result<ObjectReference> {
        let name = discovery_result_name(node_name);
        let owner_references = self
            .owner()
            .await?
            .and_then(|d| d.controller_owner_ref(&()))
            .map(|oref| vec![oref]);

        let object = LocalVolumeDiscoveryResult {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some([(HOSTNAME_LABEL.to_string(), node_name.to_string())].into()),
                owner_references,
                ..Default::default()
            },
            spec: LocalVolumeDiscoveryResultSpec {
                node_name: node_name.to_string(),
            },
            status: None,
        };
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let mut applied = json!(object);
        applied["apiVersion"] = json!(LocalVolumeDiscoveryResult::api_version(&()));
        applied["kind"] = json!(LocalVolumeDiscoveryResult::kind(&()));
        if let Some(meta) = applied.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.retain(|_, v| !v.is_null());
        }
        if let Some(obj) = applied.as_object_mut() {
            obj.remove("status");
        }
        let stored = self.results.patch(&name, &params, &Patch::Apply(&applied)).await?;

        let status = LocalVolumeDiscoveryResultStatus {
            discovered_time_stamp: Some(discovered_at),
            discovered_devices: devices.to_vec(),
        };
        self.results
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&json!({ "status": status })))
            .await?;
        debug!("Updated {} with {} devices", stored.name_any(), devices.len());

        Ok(stored.object_ref(&()))
    }
}

// =============================================================================
// Node Identity
// =============================================================================

/// Load the local node's name, UID and labels
pub async fn load_node_identity(client: Client, node_name: &str) -> Result<NodeIdentity> {
    let nodes: Api<Node> = Api::all(client);
    let node = nodes.get_opt(node_name).await?.ok_or_else(|| Error::ResourceNotFound {
        kind: "Node".into(),
        name: node_name.to_string(),
    })?;
    Ok(NodeIdentity {
        name: node_name.to_string(),
        uid: node.uid().ok_or_else(|| Error::MissingMetadata(format!("Node/{}", node_name)))?,
        labels: node.labels().clone(),
    })
}
