//! Workload objects: the scale target and the evaluation job.
//!
//! Only the fields the controller reads or writes are modelled; everything
//! else rides along in flattened `extra` maps.

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Label the job controller puts on every pod it creates.
pub const JOB_NAME_LABEL: &str = "job-name";

/// Label linking an evaluation job (and its pods) back to its policy.
pub const POLICY_LABEL: &str = "cronscale.io/policy";

/// Restart policy that surfaces container failure as job failure.
pub const RESTART_POLICY_NEVER: &str = "Never";

/// `apps/v1` Deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    #[serde(default = "Deployment::api_version")]
    pub api_version: String,

    #[serde(default = "Deployment::kind")]
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: DeploymentSpec,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Deployment {
    fn api_version() -> String {
        "apps/v1".to_string()
    }

    fn kind() -> String {
        "Deployment".to_string()
    }

    /// A minimal deployment with the given replica count.
    pub fn new(metadata: ObjectMeta, replicas: Option<i32>) -> Self {
        Self {
            api_version: Self::api_version(),
            kind: Self::kind(),
            metadata,
            spec: DeploymentSpec {
                replicas,
                extra: Default::default(),
            },
            extra: Default::default(),
        }
    }

    /// Replica count, applying the cluster default of 1 when unset.
    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `batch/v1` JobTemplateSpec as embedded in a policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    #[serde(default)]
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<i32>,

    #[serde(default)]
    pub template: PodTemplateSpec,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    #[serde(default)]
    pub spec: PodSpec,
}

/// Pod spec; containers, volumes and the rest stay opaque.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `batch/v1` Job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default = "Job::api_version")]
    pub api_version: String,

    #[serde(default = "Job::kind")]
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: JobSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

impl Job {
    fn api_version() -> String {
        "batch/v1".to_string()
    }

    fn kind() -> String {
        "Job".to_string()
    }

    pub fn new(metadata: ObjectMeta, spec: JobSpec) -> Self {
        Self {
            api_version: Self::api_version(),
            kind: Self::kind(),
            metadata,
            spec,
            status: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub active: i32,

    #[serde(default)]
    pub succeeded: i32,

    #[serde(default)]
    pub failed: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<JobCondition>,
}

impl JobStatus {
    /// True if a condition of `type_` is present with status `True`.
    pub fn has_condition(&self, type_: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    }

    /// Reason/message of the first true condition of `type_`.
    pub fn condition_reason(&self, type_: &str) -> Option<String> {
        self.conditions
            .iter()
            .find(|c| c.type_ == type_ && c.status == "True")
            .map(|c| match (&c.reason, &c.message) {
                (Some(r), Some(m)) => format!("{}: {}", r, m),
                (Some(r), None) => r.clone(),
                (None, Some(m)) => m.clone(),
                (None, None) => type_.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobCondition {
    pub fn new(type_: &str, reason: Option<&str>) -> Self {
        Self {
            type_: type_.to_string(),
            status: "True".to_string(),
            reason: reason.map(str::to_string),
            message: None,
        }
    }
}

/// `v1` Pod, reduced to identity and phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
}

impl Pod {
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }

    pub fn is_succeeded(&self) -> bool {
        self.phase() == Some("Succeeded")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}
