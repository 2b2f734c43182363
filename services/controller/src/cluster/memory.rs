//! In-memory cluster for testing and development.
//!
//! Behaves like the API server where the controller depends on it:
//! optimistic concurrency on `resourceVersion`, name collisions on create,
//! label-selected pod listing and tail-limited log reads. Jobs are driven by
//! a [`JobScript`] that decides how each created job finishes. Every write is
//! recorded so tests can assert on exactly what the controller changed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cronscale_resources::{
    Deployment, Job, JobCondition, JobStatus, ObjectKey, ObjectMeta, Pod, PodStatus,
    ScalingPolicy, JOB_NAME_LABEL,
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{ClusterApi, ClusterError, ClusterResult};

/// Cluster operations, used for failure injection and write accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    ListPolicies,
    GetPolicy,
    UpdatePolicyStatus,
    GetDeployment,
    UpdateDeployment,
    CreateJob,
    GetJob,
    ListPods,
    StreamOutput,
}

/// A mutation observed by the in-memory cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: Operation,
    pub key: ObjectKey,
}

/// How a created job behaves once the controller observes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JobScript {
    /// Complete with one succeeded pod that printed `output`.
    Succeed { output: String },

    /// Fail with the given condition reason and no succeeded pod.
    Fail { reason: String },

    /// Report completion but leave no succeeded pod to read from.
    SucceedWithoutPod,

    /// Stay active indefinitely.
    #[default]
    Hang,
}

impl JobScript {
    pub fn succeed(output: impl Into<String>) -> Self {
        Self::Succeed {
            output: output.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
struct StoredJob {
    job: Job,
    script: Option<JobScript>,
}

#[derive(Debug, Default)]
struct Store {
    version: u64,
    policies: BTreeMap<ObjectKey, ScalingPolicy>,
    deployments: BTreeMap<ObjectKey, Deployment>,
    jobs: BTreeMap<ObjectKey, StoredJob>,
    pods: BTreeMap<ObjectKey, Pod>,
    logs: BTreeMap<ObjectKey, Vec<u8>>,
    script: JobScript,
    failures: BTreeMap<Operation, (ClusterError, bool)>,
    writes: Vec<WriteRecord>,
}

impl Store {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_failure(&mut self, op: Operation) -> ClusterResult<()> {
        match self.failures.remove(&op) {
            Some((err, sticky)) => {
                if sticky {
                    self.failures.insert(op, (err.clone(), true));
                }
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn stamp(&mut self, meta: &mut ObjectMeta) {
        if meta.uid.is_none() {
            meta.uid = Some(Uuid::new_v4().to_string());
        }
        meta.resource_version = Some(self.next_version());
    }

    /// Apply the job's script the first time it is observed.
    fn advance_job(&mut self, key: &ObjectKey) {
        let Some(stored) = self.jobs.get_mut(key) else {
            return;
        };
        let Some(script) = stored.script.take() else {
            return;
        };

        let backoff_limit = stored.job.spec.backoff_limit.unwrap_or(6);
        let status = stored.job.status.get_or_insert_with(JobStatus::default);
        let pod_phase = match &script {
            JobScript::Succeed { .. } | JobScript::SucceedWithoutPod => {
                status.active = 0;
                status.succeeded = 1;
                status.conditions.push(JobCondition::new("Complete", None));
                "Succeeded"
            }
            JobScript::Fail { reason } => {
                status.active = 0;
                status.failed = backoff_limit + 1;
                status
                    .conditions
                    .push(JobCondition::new("Failed", Some(reason.as_str())));
                "Failed"
            }
            JobScript::Hang => {
                status.active = 1;
                "Running"
            }
        };

        debug!(job = %key, phase = pod_phase, "[MEMORY] Job advanced");

        if script == JobScript::SucceedWithoutPod {
            return;
        }

        let pod_key = ObjectKey::new(&key.namespace, format!("{}-{}", key.name, self.version));
        let mut meta = ObjectMeta::named(&pod_key.namespace, &pod_key.name);
        meta.labels
            .insert(JOB_NAME_LABEL.to_string(), key.name.clone());
        self.stamp(&mut meta);
        self.pods.insert(
            pod_key.clone(),
            Pod {
                metadata: meta,
                status: Some(PodStatus {
                    phase: Some(pod_phase.to_string()),
                }),
            },
        );
        if let JobScript::Succeed { output } = script {
            self.logs.insert(pod_key, output.into_bytes());
        }
    }
}

/// In-memory [`ClusterApi`] implementation.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    store: RwLock<Store>,
}

impl MemoryCluster {
    /// Create an empty cluster whose jobs hang until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a policy as if a user had applied it; returns the stored copy.
    pub async fn insert_policy(&self, mut policy: ScalingPolicy) -> ScalingPolicy {
        let mut store = self.store.write().await;
        store.stamp(&mut policy.metadata);
        store
            .policies
            .insert(policy.metadata.key(), policy.clone());
        policy
    }

    /// Replace a policy's spec, keeping its status (a user edit).
    pub async fn edit_policy(&self, key: &ObjectKey, edit: impl FnOnce(&mut ScalingPolicy)) {
        let mut store = self.store.write().await;
        let version = store.next_version();
        if let Some(policy) = store.policies.get_mut(key) {
            edit(policy);
            policy.metadata.resource_version = Some(version);
        }
    }

    pub async fn delete_policy(&self, key: &ObjectKey) {
        self.store.write().await.policies.remove(key);
    }

    pub async fn insert_deployment(&self, mut deployment: Deployment) -> Deployment {
        let mut store = self.store.write().await;
        store.stamp(&mut deployment.metadata);
        store
            .deployments
            .insert(deployment.metadata.key(), deployment.clone());
        deployment
    }

    /// Script applied to every job created from now on.
    pub async fn set_job_script(&self, script: JobScript) {
        self.store.write().await.script = script;
    }

    /// Re-arm an existing job so its next observation applies `script`.
    pub async fn rescript_job(&self, key: &ObjectKey, script: JobScript) {
        if let Some(stored) = self.store.write().await.jobs.get_mut(key) {
            stored.script = Some(script);
        }
    }

    /// Fail the next call of `op` with `err`.
    pub async fn fail_next(&self, op: Operation, err: ClusterError) {
        self.store.write().await.failures.insert(op, (err, false));
    }

    /// Fail every call of `op` with `err` until [`clear_failures`](Self::clear_failures).
    pub async fn fail_always(&self, op: Operation, err: ClusterError) {
        self.store.write().await.failures.insert(op, (err, true));
    }

    pub async fn clear_failures(&self) {
        self.store.write().await.failures.clear();
    }

    pub async fn policy(&self, key: &ObjectKey) -> Option<ScalingPolicy> {
        self.store.read().await.policies.get(key).cloned()
    }

    pub async fn deployment(&self, key: &ObjectKey) -> Option<Deployment> {
        self.store.read().await.deployments.get(key).cloned()
    }

    /// All jobs ever created, in name order.
    pub async fn jobs(&self) -> Vec<Job> {
        self.store
            .read()
            .await
            .jobs
            .values()
            .map(|s| s.job.clone())
            .collect()
    }

    /// Every write performed so far, in order.
    pub async fn writes(&self) -> Vec<WriteRecord> {
        self.store.read().await.writes.clone()
    }

    /// Number of writes of kind `op`.
    pub async fn write_count(&self, op: Operation) -> usize {
        self.store
            .read()
            .await
            .writes
            .iter()
            .filter(|w| w.op == op)
            .count()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn list_policies(&self, namespace: Option<&str>) -> ClusterResult<Vec<ScalingPolicy>> {
        let mut store = self.store.write().await;
        store.check_failure(Operation::ListPolicies)?;
        Ok(store
            .policies
            .values()
            .filter(|p| namespace.map_or(true, |ns| p.metadata.namespace() == ns))
            .cloned()
            .collect())
    }

    async fn get_policy(&self, key: &ObjectKey) -> ClusterResult<ScalingPolicy> {
        let mut store = self.store.write().await;
        store.check_failure(Operation::GetPolicy)?;
        store
            .policies
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("ScalingPolicy", key))
    }

    async fn update_policy_status(&self, policy: &ScalingPolicy) -> ClusterResult<ScalingPolicy> {
        let mut store = self.store.write().await;
        store.check_failure(Operation::UpdatePolicyStatus)?;

        let key = policy.metadata.key();
        let version = store.next_version();
        let current = store
            .policies
            .get_mut(&key)
            .ok_or_else(|| ClusterError::not_found("ScalingPolicy", &key))?;

        if let Some(expected) = &policy.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(expected) {
                return Err(ClusterError::Conflict(format!(
                    "scalingpolicies \"{}\": the object has been modified",
                    key.name
                )));
            }
        }

        current.status = policy.status.clone();
        current.metadata.resource_version = Some(version);
        let updated = current.clone();

        store.writes.push(WriteRecord {
            op: Operation::UpdatePolicyStatus,
            key,
        });
        Ok(updated)
    }

    async fn get_deployment(&self, key: &ObjectKey) -> ClusterResult<Deployment> {
        let mut store = self.store.write().await;
        store.check_failure(Operation::GetDeployment)?;
        store
            .deployments
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("Deployment", key))
    }

    async fn update_deployment(&self, deployment: &Deployment) -> ClusterResult<Deployment> {
        let mut store = self.store.write().await;
        store.check_failure(Operation::UpdateDeployment)?;

        let key = deployment.metadata.key();
        let version = store.next_version();
        let current = store
            .deployments
            .get_mut(&key)
            .ok_or_else(|| ClusterError::not_found("Deployment", &key))?;

        if current.metadata.resource_version != deployment.metadata.resource_version {
            return Err(ClusterError::Conflict(format!(
                "deployments.apps \"{}\": the object has been modified",
                key.name
            )));
        }

        *current = deployment.clone();
        current.metadata.resource_version = Some(version);
        let updated = current.clone();

        store.writes.push(WriteRecord {
            op: Operation::UpdateDeployment,
            key,
        });
        Ok(updated)
    }

    async fn create_job(&self, job: &Job) -> ClusterResult<Job> {
        let mut store = self.store.write().await;
        store.check_failure(Operation::CreateJob)?;

        if job.metadata.name().is_empty() {
            return Err(ClusterError::Invalid("job name is required".into()));
        }
        let key = job.metadata.key();
        if store.jobs.contains_key(&key) {
            return Err(ClusterError::Conflict(format!(
                "jobs.batch \"{}\" already exists",
                key.name
            )));
        }

        let mut created = job.clone();
        store.stamp(&mut created.metadata);
        created.status = Some(JobStatus::default());
        let script = store.script.clone();
        store.jobs.insert(
            key.clone(),
            StoredJob {
                job: created.clone(),
                script: Some(script),
            },
        );

        store.writes.push(WriteRecord {
            op: Operation::CreateJob,
            key,
        });
        Ok(created)
    }

    async fn get_job(&self, key: &ObjectKey) -> ClusterResult<Job> {
        let mut store = self.store.write().await;
        store.check_failure(Operation::GetJob)?;
        store.advance_job(key);
        store
            .jobs
            .get(key)
            .map(|s| s.job.clone())
            .ok_or_else(|| ClusterError::not_found("Job", key))
    }

    async fn list_pods(&self, namespace: &str, selector: (&str, &str)) -> ClusterResult<Vec<Pod>> {
        let mut store = self.store.write().await;
        store.check_failure(Operation::ListPods)?;
        let (label, value) = selector;
        Ok(store
            .pods
            .values()
            .filter(|p| p.metadata.namespace() == namespace)
            .filter(|p| p.metadata.labels.get(label).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn stream_output(&self, pod: &ObjectKey, tail_lines: i64) -> ClusterResult<Vec<u8>> {
        let mut store = self.store.write().await;
        store.check_failure(Operation::StreamOutput)?;
        if !store.pods.contains_key(pod) {
            return Err(ClusterError::not_found("Pod", pod));
        }

        let output = store.logs.get(pod).cloned().unwrap_or_default();
        let text = String::from_utf8_lossy(&output);
        let lines: Vec<&str> = text.lines().collect();
        let keep = usize::try_from(tail_lines).unwrap_or(0).min(lines.len());
        let mut tail = lines[lines.len() - keep..].join("\n");
        if keep > 0 {
            tail.push('\n');
        }
        Ok(tail.into_bytes())
    }
}
