//! Shared CRD Types
//!
//! Types reused across the LocalVolume, LocalVolumeSet and discovery
//! resources: management state, log level, conditions, and child
//! workload generation tracking.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by every custom resource of the operator
pub const GROUP: &str = "local.storage.openshift.io";

// =============================================================================
// Management State
// =============================================================================

/// How much control the operator exercises over a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ManagementState {
    #[default]
    Managed,
    Unmanaged,
    Removed,
    Force,
}

impl ManagementState {
    /// Whether child resources should be driven towards the spec
    pub fn is_managed(&self) -> bool {
        matches!(self, ManagementState::Managed | ManagementState::Force)
    }
}

impl std::fmt::Display for ManagementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagementState::Managed => write!(f, "Managed"),
            ManagementState::Unmanaged => write!(f, "Unmanaged"),
            ManagementState::Removed => write!(f, "Removed"),
            ManagementState::Force => write!(f, "Force"),
        }
    }
}

// =============================================================================
// Log Level
// =============================================================================

/// Verbosity requested for the node agents
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum LogLevel {
    #[default]
    Normal,
    Debug,
    Trace,
    TraceAll,
}

impl LogLevel {
    /// `tracing` filter directive for this level
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Normal => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace | LogLevel::TraceAll => "trace",
        }
    }
}

// =============================================================================
// Volume Mode
// =============================================================================

/// Persistent volume mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum VolumeMode {
    Block,
    #[default]
    Filesystem,
}

impl std::fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeMode::Block => write!(f, "Block"),
            VolumeMode::Filesystem => write!(f, "Filesystem"),
        }
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Condition reported on a resource status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Message
    #[serde(default)]
    pub message: Option<String>,
}

impl OperatorCondition {
    pub fn new(r#type: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status,
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Condition type: the resource is reconciled and usable
pub const CONDITION_AVAILABLE: &str = "Available";

/// Condition type: the diskmaker workload is up and configured
pub const CONDITION_DAEMONSETS_AVAILABLE: &str = "DaemonSetsAvailableAndConfigured";

/// Set or replace a condition, keeping the transition time when the status is unchanged
pub fn set_condition(conditions: &mut Vec<OperatorCondition>, condition: OperatorCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        let transition = if existing.status == condition.status {
            existing.last_transition_time
        } else {
            condition.last_transition_time
        };
        *existing = condition;
        existing.last_transition_time = transition;
    } else {
        conditions.push(condition);
    }
}

/// Find a condition by type
pub fn find_condition<'a>(
    conditions: &'a [OperatorCondition],
    r#type: &str,
) -> Option<&'a OperatorCondition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

// =============================================================================
// Child Workload Generations
// =============================================================================

/// Last observed generation of a workload owned by a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub last_generation: i64,
}

/// Record a generation, replacing any entry for the same object
pub fn set_generation(generations: &mut Vec<GenerationStatus>, entry: GenerationStatus) {
    if let Some(existing) = generations.iter_mut().find(|g| {
        g.group == entry.group
            && g.resource == entry.resource
            && g.namespace == entry.namespace
            && g.name == entry.name
    }) {
        *existing = entry;
    } else {
        generations.push(entry);
    }
}
