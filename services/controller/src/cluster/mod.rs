//! Cluster API interface.
//!
//! The controller treats the cluster as an object store with
//! get/list/create/update semantics plus log retrieval for finished pods.
//! Two implementations are provided:
//!
//! - [`HttpCluster`]: talks to a Kubernetes API server over REST
//! - [`MemoryCluster`]: in-process store for tests and local development

mod http;
mod memory;

use async_trait::async_trait;
use cronscale_resources::{Deployment, Job, ObjectKey, Pod, ScalingPolicy};

pub use http::{HttpCluster, HttpClusterConfig};
pub use memory::{JobScript, MemoryCluster, Operation, WriteRecord};

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors returned by the cluster API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// Optimistic concurrency failure or name collision.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ClusterError {
    pub fn not_found(kind: &'static str, key: &ObjectKey) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::Conflict(_) | Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Invalid(_) => false,
        }
    }
}

/// Object store operations used by the controller.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List policies, optionally restricted to one namespace.
    async fn list_policies(&self, namespace: Option<&str>) -> ClusterResult<Vec<ScalingPolicy>>;

    async fn get_policy(&self, key: &ObjectKey) -> ClusterResult<ScalingPolicy>;

    /// Write the status subresource; fails with `Conflict` if the
    /// policy's `resourceVersion` is stale.
    async fn update_policy_status(&self, policy: &ScalingPolicy) -> ClusterResult<ScalingPolicy>;

    async fn get_deployment(&self, key: &ObjectKey) -> ClusterResult<Deployment>;

    /// Replace a deployment; fails with `Conflict` if its `resourceVersion` is stale.
    async fn update_deployment(&self, deployment: &Deployment) -> ClusterResult<Deployment>;

    async fn create_job(&self, job: &Job) -> ClusterResult<Job>;

    async fn get_job(&self, key: &ObjectKey) -> ClusterResult<Job>;

    /// List pods in `namespace` carrying the label `selector.0=selector.1`.
    async fn list_pods(&self, namespace: &str, selector: (&str, &str)) -> ClusterResult<Vec<Pod>>;

    /// Read the last `tail_lines` lines of a pod's output.
    async fn stream_output(&self, pod: &ObjectKey, tail_lines: i64) -> ClusterResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let key = ObjectKey::new("default", "web");
        assert!(ClusterError::not_found("Deployment", &key).is_retryable());
        assert!(ClusterError::Conflict("stale".into()).is_retryable());
        assert!(!ClusterError::Invalid("bad".into()).is_retryable());
        assert!(ClusterError::Api {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!ClusterError::Api {
            status: 403,
            message: "forbidden".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_not_found_message() {
        let err = ClusterError::not_found("Deployment", &ObjectKey::new("prod", "api"));
        assert_eq!(err.to_string(), "Deployment prod/api not found");
    }
}
