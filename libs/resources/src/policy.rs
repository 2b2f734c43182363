//! The `ScalingPolicy` resource and its status subresource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, OwnerReference};
use crate::workload::JobTemplateSpec;

/// API group of the policy resource.
pub const GROUP: &str = "cronscale.io";

/// `apiVersion` of the policy resource.
pub const API_VERSION: &str = "cronscale.io/v1";

/// `kind` of the policy resource.
pub const KIND: &str = "ScalingPolicy";

/// URL plural of the policy resource.
pub const PLURAL: &str = "scalingpolicies";

/// Maximum number of outcomes retained in status.
pub const HISTORY_LIMIT: usize = 10;

/// A cron-driven scaling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicy {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    pub spec: ScalingPolicySpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ScalingPolicyStatus>,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

impl ScalingPolicy {
    /// Create a policy with empty status.
    pub fn new(metadata: ObjectMeta, spec: ScalingPolicySpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata,
            spec,
            status: None,
        }
    }

    /// Status, or the empty status if none has been written yet.
    pub fn status(&self) -> ScalingPolicyStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Mutable status, created empty on first access.
    pub fn status_mut(&mut self) -> &mut ScalingPolicyStatus {
        self.status.get_or_insert_with(ScalingPolicyStatus::default)
    }

    /// Owner reference pointing at this policy as controller.
    ///
    /// Returns `None` when the policy has not been persisted (no UID).
    pub fn controller_reference(&self) -> Option<OwnerReference> {
        let uid = self.metadata.uid.clone()?;
        let name = self.metadata.name.clone()?;
        Some(OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name,
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

/// Desired behaviour of a scaling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicySpec {
    pub scale_target_ref: ScaleTargetRef,

    #[serde(default)]
    pub min_replicas: u32,

    #[serde(default)]
    pub max_replicas: u32,

    /// Cron expression deciding when the job runs.
    pub schedule: String,

    /// Template for the evaluation job.
    pub job_template: JobTemplateSpec,
}

impl ScalingPolicySpec {
    /// Replica bounds as signed counts, saturating at `i32::MAX`.
    pub fn bounds(&self) -> (i32, i32) {
        let min = i32::try_from(self.min_replicas).unwrap_or(i32::MAX);
        let max = i32::try_from(self.max_replicas).unwrap_or(i32::MAX);
        (min, max)
    }
}

/// Reference to the workload whose replica count is driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTargetRef {
    pub kind: String,
    pub name: String,
}

/// Observed state persisted by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicyStatus {
    /// Most recent outcomes, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replication_status: Vec<Outcome>,

    /// When the policy is next due for evaluation (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_transition_time: Option<String>,

    /// Evaluation job submitted but not yet consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_job: Option<JobExecution>,
}

impl ScalingPolicyStatus {
    /// Append an outcome, evicting the oldest entries beyond [`HISTORY_LIMIT`].
    pub fn push_outcome(&mut self, outcome: Outcome) {
        self.replication_status.push(outcome);
        if self.replication_status.len() > HISTORY_LIMIT {
            let excess = self.replication_status.len() - HISTORY_LIMIT;
            self.replication_status.drain(..excess);
        }
    }

    pub fn last_outcome(&self) -> Option<&Outcome> {
        self.replication_status.last()
    }

    /// Desired replica count carried by the most recent outcome.
    pub fn last_desired(&self) -> Option<i32> {
        self.last_outcome().map(|o| o.desired_replica)
    }

    /// Parsed `nextTransitionTime`.
    ///
    /// `Ok(None)` when unset; `Err` when set but not RFC 3339.
    pub fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
        self.next_transition_time
            .as_deref()
            .map(crate::time::parse)
            .transpose()
    }

    pub fn set_next_due_at(&mut self, at: DateTime<Utc>) {
        self.next_transition_time = Some(crate::time::format(&at));
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Success,
    Failed,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "Success"),
            OutcomeStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// One immutable history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub status: OutcomeStatus,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(with = "crate::time")]
    pub start_at: DateTime<Utc>,

    #[serde(with = "crate::time")]
    pub next_at: DateTime<Utc>,

    pub current_replica: i32,

    pub desired_replica: i32,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Lifecycle phase of an evaluation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobPhase::Pending => "Pending",
            JobPhase::Running => "Running",
            JobPhase::Succeeded => "Succeeded",
            JobPhase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// An evaluation job that has been submitted and is being observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    /// Job name, unique per submission.
    pub name: String,

    #[serde(with = "crate::time")]
    pub started_at: DateTime<Utc>,

    pub phase: JobPhase,

    /// Effective `activeDeadlineSeconds` of the submitted job.
    pub deadline_seconds: i64,
}
