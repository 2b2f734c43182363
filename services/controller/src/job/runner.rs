//! Job submission and observation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronscale_reconcile::DEFAULT_POLL_INTERVAL;
use cronscale_resources::{JobExecution, JobPhase, ObjectKey, ScalingPolicy, JOB_NAME_LABEL};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::template::{materialize, DEFAULT_ACTIVE_DEADLINE_SECONDS};
use super::JobError;
use crate::cluster::ClusterApi;
use crate::parse::{last_line, parse_replicas};

/// Time allowed past the job's own deadline for status to propagate.
pub const DEFAULT_DEADLINE_GRACE: Duration = Duration::from_secs(5);

/// Longest deadline tracked locally; larger template values are capped.
pub const MAX_TRACKED_DEADLINE_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Point-in-time state of a submitted job.
#[derive(Debug, Clone)]
pub enum Observation {
    /// Created but no pod is running yet.
    Pending,

    Running,

    /// Finished; carries the raw (unclamped) replica count it printed.
    Succeeded(i32),

    Failed(JobError),
}

impl Observation {
    pub fn phase(&self) -> JobPhase {
        match self {
            Self::Pending => JobPhase::Pending,
            Self::Running => JobPhase::Running,
            Self::Succeeded(_) => JobPhase::Succeeded,
            Self::Failed(_) => JobPhase::Failed,
        }
    }
}

/// Runs evaluation jobs against the cluster.
pub struct JobRunner {
    cluster: Arc<dyn ClusterApi>,
    poll_interval: Duration,
    deadline_grace: Duration,
}

impl JobRunner {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline_grace: DEFAULT_DEADLINE_GRACE,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_deadline_grace(mut self, grace: Duration) -> Self {
        self.deadline_grace = grace;
        self
    }

    /// Create the evaluation job for `policy`.
    #[instrument(skip(self, policy), fields(policy = %policy.metadata.key()))]
    pub async fn submit(
        &self,
        policy: &ScalingPolicy,
        now: DateTime<Utc>,
    ) -> Result<JobExecution, JobError> {
        let job = materialize(policy, now)?;
        let created = self
            .cluster
            .create_job(&job)
            .await
            .map_err(JobError::Submission)?;

        let execution = JobExecution {
            name: created.metadata.name().to_string(),
            started_at: now,
            phase: JobPhase::Pending,
            deadline_seconds: created
                .spec
                .active_deadline_seconds
                .unwrap_or(DEFAULT_ACTIVE_DEADLINE_SECONDS)
                .clamp(1, MAX_TRACKED_DEADLINE_SECONDS),
        };

        info!(
            job = %execution.name,
            deadline_seconds = execution.deadline_seconds,
            "Submitted evaluation job"
        );
        Ok(execution)
    }

    /// Classify a submitted job; reads its output once it has succeeded.
    pub async fn observe(
        &self,
        namespace: &str,
        execution: &JobExecution,
        now: DateTime<Utc>,
    ) -> Observation {
        let key = ObjectKey::new(namespace, &execution.name);
        let job = match self.cluster.get_job(&key).await {
            Ok(job) => job,
            Err(e) => return Observation::Failed(JobError::Poll(e)),
        };
        let status = job.status.unwrap_or_default();

        if status.succeeded > 0 || status.has_condition("Complete") {
            return match self.read_result(namespace, &execution.name).await {
                Ok(raw) => Observation::Succeeded(raw),
                Err(e) => Observation::Failed(e),
            };
        }

        if status.has_condition("Failed") {
            let reason = status
                .condition_reason("Failed")
                .unwrap_or_else(|| "Failed".to_string());
            if reason.starts_with("DeadlineExceeded") {
                return Observation::Failed(JobError::Timeout {
                    deadline_seconds: execution.deadline_seconds,
                });
            }
            return Observation::Failed(JobError::TerminalFailure { reason });
        }

        if self
            .local_deadline(execution)
            .is_some_and(|deadline| now >= deadline)
        {
            warn!(job = %key, "Job still not finished past its deadline");
            return Observation::Failed(JobError::Timeout {
                deadline_seconds: execution.deadline_seconds,
            });
        }

        if status.active > 0 {
            Observation::Running
        } else {
            Observation::Pending
        }
    }

    /// When the job counts as timed out even if the cluster has not said so.
    ///
    /// `None` if the deadline is beyond what a timestamp can represent.
    fn local_deadline(&self, execution: &JobExecution) -> Option<DateTime<Utc>> {
        let deadline = chrono::Duration::try_seconds(execution.deadline_seconds)?;
        let grace = chrono::Duration::from_std(self.deadline_grace).unwrap_or_default();
        execution
            .started_at
            .checked_add_signed(deadline)?
            .checked_add_signed(grace)
    }

    /// Submit and wait for the result, polling until terminal or shutdown.
    ///
    /// Cancellation returns [`JobError::Cancelled`] and leaves the job to
    /// its own deadline.
    pub async fn run(
        &self,
        policy: &ScalingPolicy,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<i32, JobError> {
        let namespace = policy.metadata.namespace();
        let execution = self.submit(policy, Utc::now()).await?;
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.observe(namespace, &execution, Utc::now()).await {
                        Observation::Succeeded(raw) => return Ok(raw),
                        Observation::Failed(e) => return Err(e),
                        pending => debug!(job = %execution.name, phase = %pending.phase(), "Waiting for job"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(job = %execution.name, "Job observation cancelled");
                        return Err(JobError::Cancelled);
                    }
                }
            }
        }
    }

    async fn read_result(&self, namespace: &str, job: &str) -> Result<i32, JobError> {
        let pods = self
            .cluster
            .list_pods(namespace, (JOB_NAME_LABEL, job))
            .await
            .map_err(JobError::PodList)?;
        let pod = pods
            .iter()
            .find(|p| p.is_succeeded())
            .ok_or(JobError::NoSuccessfulUnit)?;

        let raw = self
            .cluster
            .stream_output(&pod.metadata.key(), 1)
            .await
            .map_err(JobError::OutputRetrieval)?;

        parse_replicas(last_line(&raw)).map_err(JobError::OutputParse)
    }
}
