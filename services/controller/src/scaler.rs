//! Scale target convergence.

use std::sync::Arc;

use cronscale_reconcile::ConvergenceStatus;
use cronscale_resources::{ObjectKey, ScaleTargetRef};
use tracing::{debug, info, instrument};

use crate::cluster::{ClusterApi, ClusterError};

/// Target kinds the scaler can drive, lower-cased.
pub const SUPPORTED_TARGET_KINDS: &[&str] = &["deployment", "deploy"];

/// Errors from converging a scale target.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScaleError {
    #[error("unsupported scale target kind: {kind}")]
    UnsupportedKind { kind: String },

    #[error("scale target {key} not found")]
    NotFound { key: String },

    #[error("scale target update conflict: {0}")]
    Conflict(String),

    #[error("scale target request failed: {0}")]
    Cluster(ClusterError),
}

impl ScaleError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnsupportedKind { .. } => false,
            Self::NotFound { .. } | Self::Conflict(_) => true,
            Self::Cluster(e) => e.is_retryable(),
        }
    }

    fn from_cluster(err: ClusterError, key: &ObjectKey) -> Self {
        match err {
            ClusterError::NotFound { .. } => Self::NotFound {
                key: key.to_string(),
            },
            ClusterError::Conflict(message) => Self::Conflict(message),
            other => Self::Cluster(other),
        }
    }
}

/// Case-insensitive membership in [`SUPPORTED_TARGET_KINDS`].
pub fn is_supported_kind(kind: &str) -> bool {
    let kind = kind.to_ascii_lowercase();
    SUPPORTED_TARGET_KINDS.contains(&kind.as_str())
}

pub fn check_kind(target: &ScaleTargetRef) -> Result<(), ScaleError> {
    if is_supported_kind(&target.kind) {
        Ok(())
    } else {
        Err(ScaleError::UnsupportedKind {
            kind: target.kind.clone(),
        })
    }
}

/// Outcome of one convergence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleResult {
    /// Replica count observed before any write.
    pub previous: i32,
    pub desired: i32,
    pub status: ConvergenceStatus,
}

impl ScaleResult {
    /// Whether a write was issued.
    pub fn updated(&self) -> bool {
        self.status.is_converging()
    }
}

/// Drives a target's replica count to a desired value.
pub struct TargetScaler {
    cluster: Arc<dyn ClusterApi>,
}

impl TargetScaler {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Set `target`'s replicas to `desired`, writing only if they differ.
    #[instrument(skip(self, target), fields(target = %target.name, kind = %target.kind))]
    pub async fn reconcile_target(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        desired: i32,
    ) -> Result<ScaleResult, ScaleError> {
        check_kind(target)?;

        let key = ObjectKey::new(namespace, &target.name);
        let mut deployment = self
            .cluster
            .get_deployment(&key)
            .await
            .map_err(|e| ScaleError::from_cluster(e, &key))?;

        let previous = deployment.replicas();
        if previous == desired {
            debug!(replicas = previous, "Target already converged");
            return Ok(ScaleResult {
                previous,
                desired,
                status: ConvergenceStatus::Converged,
            });
        }

        deployment.spec.replicas = Some(desired);
        self.cluster
            .update_deployment(&deployment)
            .await
            .map_err(|e| ScaleError::from_cluster(e, &key))?;

        info!(previous, desired, "Scaled target");
        Ok(ScaleResult {
            previous,
            desired,
            status: ConvergenceStatus::Converging,
        })
    }
}
