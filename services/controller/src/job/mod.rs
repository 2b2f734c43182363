//! Ephemeral evaluation jobs.
//!
//! A policy is evaluated by running its job template once to completion
//! and reading the last line printed by the successful pod. The lifecycle
//! is split into two phases so no reconcile blocks on a running job:
//!
//! 1. [`JobRunner::submit`] materializes and creates the job
//! 2. [`JobRunner::observe`] classifies its current state and, once it has
//!    succeeded, extracts the result
//!
//! [`JobRunner::run`] composes both with a poll loop for callers that can
//! afford to wait.

mod runner;
mod template;

pub use runner::{JobRunner, Observation, DEFAULT_DEADLINE_GRACE};
pub use template::{
    job_name, materialize, DEFAULT_ACTIVE_DEADLINE_SECONDS, DEFAULT_BACKOFF_LIMIT,
};

use crate::cluster::ClusterError;
use crate::parse::ParseError;

/// Errors from running an evaluation job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("failed to submit job: {0}")]
    Submission(ClusterError),

    /// The policy cannot own the job (it has never been persisted).
    #[error("cannot set owner reference: policy has no uid")]
    OwnerReference,

    #[error("failed to read job status: {0}")]
    Poll(ClusterError),

    #[error("job failed without a successful pod: {reason}")]
    TerminalFailure { reason: String },

    #[error("job did not finish within {deadline_seconds}s")]
    Timeout { deadline_seconds: i64 },

    #[error("job completed but no succeeded pod was found")]
    NoSuccessfulUnit,

    #[error("failed to list job pods: {0}")]
    PodList(ClusterError),

    #[error("failed to read pod output: {0}")]
    OutputRetrieval(ClusterError),

    #[error("failed to parse pod output: {0}")]
    OutputParse(ParseError),

    #[error("job observation cancelled")]
    Cancelled,
}

impl JobError {
    /// Whether the same evaluation could succeed if retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Submission(e) | Self::Poll(e) | Self::PodList(e) | Self::OutputRetrieval(e) => {
                e.is_retryable()
            }
            Self::Cancelled => true,
            Self::OwnerReference
            | Self::TerminalFailure { .. }
            | Self::Timeout { .. }
            | Self::NoSuccessfulUnit
            | Self::OutputParse(_) => false,
        }
    }
}
