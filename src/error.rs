//! Error types for the Local Storage Operator
//!
//! Provides structured error types for the control-plane reconcilers and
//! the on-node device pipeline (enumeration, locking, symlinks, volumes).

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Object {0} is missing required metadata")]
    MissingMetadata(String),

    // =========================================================================
    // Finalizer Errors
    // =========================================================================
    #[error("Deletion of {owner} blocked: {bound} persistent volume(s) still Bound or Released")]
    DeletionBlocked { owner: String, bound: usize },

    // =========================================================================
    // Device Enumeration Errors
    // =========================================================================
    #[error("Block device listing failed: {0}")]
    BlockList(String),

    #[error("No /dev/disk/by-id path found for device {kname}")]
    IdPathNotFound { kname: String },

    #[error("Device predicate {predicate} failed for {device}: {reason}")]
    DevicePredicate {
        predicate: String,
        device: String,
        reason: String,
    },

    // =========================================================================
    // Device Path Misconfiguration
    // =========================================================================
    #[error("Device path {path} does not exist")]
    DevicePathMissing { path: String },

    #[error("Device path {path} is a directory")]
    DevicePathIsDirectory { path: String },

    #[error("Device path {path} is a regular file")]
    DevicePathIsFile { path: String },

    // =========================================================================
    // Lock & Symlink Errors
    // =========================================================================
    #[error("Could not acquire PV-creation lock for {device}: {reason}")]
    LockFailed { device: String, reason: String },

    #[error("Symlink {link} could not be created: {reason}")]
    Symlink { link: String, reason: String },

    #[error("Symlink {link} already resolves to a different device ({existing})")]
    SymlinkConflict { link: String, existing: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Invalid quantity for {field}: {value:?}")]
    InvalidQuantity { field: String, value: String },

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::BlockList(_) | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Waiting on volumes to leave Bound/Released
            Error::DeletionBlocked { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Contention on a single device clears itself on the next pass
            Error::LockFailed { .. } | Error::Symlink { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::InvalidQuantity { .. }
            | Error::DevicePathMissing { .. }
            | Error::DevicePathIsDirectory { .. }
            | Error::DevicePathIsFile { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::BlockList(_))
    }

    /// Check if this is an API 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Error::ResourceNotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this is an API 409
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            Error::ResourceExists { .. } => true,
            _ => false,
        }
    }
}

/// Returns true when a kube error is an API 404
pub fn kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Returns true when a kube error is an API 409
pub fn kube_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
