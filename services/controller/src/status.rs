//! Status persistence for scaling policies.
//!
//! All status writes go through [`StatusRecorder::record`]: the update is
//! applied to the caller's working copy, then written with the copy's
//! `resourceVersion`. On success the persisted object replaces the working
//! copy so a second write in the same reconcile carries the fresh version.
//! On failure the working copy keeps the mutation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use cronscale_resources::{JobExecution, Outcome, ScalingPolicy, ScalingPolicyStatus};
use tracing::{debug, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError};

/// Errors from persisting status.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StatusError {
    /// Someone else wrote the policy since it was read.
    #[error("status write conflict: {0}")]
    Conflict(String),

    #[error("failed to persist status: {0}")]
    Persist(ClusterError),
}

impl StatusError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Persist(e) => e.is_retryable(),
        }
    }
}

/// A set of status changes written together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    outcome: Option<Outcome>,
    next_at: Option<DateTime<Utc>>,
    execution: Option<Option<JobExecution>>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an outcome to the history.
    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Set when the policy is next due.
    pub fn next_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_at = Some(at);
        self
    }

    /// Track an in-flight job.
    pub fn start_execution(mut self, execution: JobExecution) -> Self {
        self.execution = Some(Some(execution));
        self
    }

    /// Stop tracking the in-flight job.
    pub fn clear_execution(mut self) -> Self {
        self.execution = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.outcome.is_none() && self.next_at.is_none() && self.execution.is_none()
    }

    pub fn apply(&self, status: &mut ScalingPolicyStatus) {
        if let Some(outcome) = &self.outcome {
            status.push_outcome(outcome.clone());
        }
        if let Some(at) = self.next_at {
            status.set_next_due_at(at);
        }
        if let Some(execution) = &self.execution {
            status.active_job = execution.clone();
        }
    }
}

/// Writes status updates with optimistic concurrency.
pub struct StatusRecorder {
    cluster: Arc<dyn ClusterApi>,
}

impl StatusRecorder {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Apply `update` to `policy` and persist it.
    #[instrument(skip(self, policy, update), fields(policy = %policy.metadata.key()))]
    pub async fn record(
        &self,
        policy: &mut ScalingPolicy,
        update: StatusUpdate,
    ) -> Result<(), StatusError> {
        if update.is_empty() {
            return Ok(());
        }

        update.apply(policy.status_mut());

        match self.cluster.update_policy_status(policy).await {
            Ok(persisted) => {
                debug!(
                    resource_version = persisted.metadata.resource_version.as_deref().unwrap_or_default(),
                    "Status persisted"
                );
                *policy = persisted;
                Ok(())
            }
            Err(ClusterError::Conflict(message)) => {
                debug!(error = %message, "Status write conflicted");
                Err(StatusError::Conflict(message))
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist status");
                Err(StatusError::Persist(e))
            }
        }
    }
}
