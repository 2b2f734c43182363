//! Scaling policy reconciler.
//!
//! One reconcile pass reads the policy fresh from the cluster and takes
//! exactly one of three paths:
//!
//! 1. An evaluation job is in flight (`status.activeJob`): observe it. A
//!    finished job is consumed (outcome appended, target scaled, job
//!    untracked); an unfinished one requeues at the poll interval.
//! 2. `status.nextTransitionTime` is in the future: the policy is not due.
//!    After a successful evaluation the target is re-converged to the last
//!    desired count; nothing else happens.
//! 3. Otherwise the policy is due: validate the schedule and target kind,
//!    submit a job, track it in status and observe it once.
//!
//! Failures never propagate as errors: they are recorded as `Failed`
//! outcomes and reported with a short retry hint. Only a failure to read
//! the policy itself is returned as `Err`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronscale_reconcile::{clamp_replicas, later, Requeue, DEFAULT_POLL_INTERVAL, DEFAULT_RETRY_INTERVAL};
use cronscale_resources::{
    JobExecution, ObjectKey, Outcome, OutcomeStatus, ScalingPolicy,
};
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError};
use crate::job::{JobError, JobRunner, Observation, DEFAULT_DEADLINE_GRACE};
use crate::scaler::{check_kind, ScaleError, TargetScaler};
use crate::schedule::{self, ScheduleError};
use crate::status::{StatusError, StatusRecorder, StatusUpdate};

/// When a policy is next due after a failed evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureRetry {
    /// Wait for the next schedule occurrence.
    #[default]
    NextTick,

    /// Retry after a fixed delay.
    Fixed(Duration),
}

impl FromStr for FailureRetry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "next-tick" {
            return Ok(Self::NextTick);
        }
        if let Some(secs) = s.strip_prefix("fixed:") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| format!("invalid failure retry delay: {}", secs))?;
            if secs == 0 {
                return Err("failure retry delay must be positive".to_string());
            }
            return Ok(Self::Fixed(Duration::from_secs(secs)));
        }
        Err(format!(
            "invalid failure retry {:?} (expected next-tick or fixed:<secs>)",
            s
        ))
    }
}

impl std::fmt::Display for FailureRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureRetry::NextTick => write!(f, "next-tick"),
            FailureRetry::Fixed(d) => write!(f, "fixed:{}", d.as_secs()),
        }
    }
}

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Requeue hint after errors.
    pub retry_interval: Duration,

    /// Requeue hint while a job is in flight.
    pub poll_interval: Duration,

    /// Slack past a job's deadline before it is declared timed out.
    pub deadline_grace: Duration,

    pub failure_retry: FailureRetry,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline_grace: DEFAULT_DEADLINE_GRACE,
            failure_retry: FailureRetry::NextTick,
        }
    }
}

/// Path taken by a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingState {
    NotDue,
    Due,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for SchedulingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchedulingState::NotDue => "NotDue",
            SchedulingState::Due => "Due",
            SchedulingState::Running => "Running",
            SchedulingState::Succeeded => "Succeeded",
            SchedulingState::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Errors surfaced by a reconcile pass.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to read policy: {0}")]
    Fetch(ClusterError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Scale(#[from] ScaleError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_retryable(),
            Self::Schedule(_) => false,
            Self::Job(e) => e.is_retryable(),
            Self::Scale(e) => e.is_retryable(),
            Self::Status(e) => e.is_retryable(),
        }
    }

    /// Whether the error is a failure to persist status.
    pub fn is_status(&self) -> bool {
        matches!(self, Self::Status(_))
    }
}

/// Result of a reconcile pass.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub state: SchedulingState,

    /// Replica count the target should have after this pass.
    pub desired: i32,

    pub requeue: Requeue,

    /// Recorded or transient failure, if any.
    pub error: Option<ReconcileError>,

    /// Policy `resourceVersion` after this pass's own writes.
    pub resource_version: Option<String>,
}

impl ReconcileReport {
    fn new(state: SchedulingState, policy: &ScalingPolicy, desired: i32, requeue: Requeue) -> Self {
        Self {
            state,
            desired,
            requeue,
            error: None,
            resource_version: policy.metadata.resource_version.clone(),
        }
    }

    fn with_error(mut self, error: impl Into<ReconcileError>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn requeue_after(&self) -> Duration {
        self.requeue.delay()
    }
}

/// Drives scaling policies through their evaluation cycle.
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    runner: JobRunner,
    scaler: TargetScaler,
    recorder: StatusRecorder,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ReconcilerConfig) -> Self {
        Self {
            runner: JobRunner::new(cluster.clone())
                .with_poll_interval(config.poll_interval)
                .with_deadline_grace(config.deadline_grace),
            scaler: TargetScaler::new(cluster.clone()),
            recorder: StatusRecorder::new(cluster.clone()),
            cluster,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconcile the policy at `key` as of now.
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ReconcileReport>, ReconcileError> {
        self.reconcile_at(key, Utc::now()).await
    }

    /// Reconcile the policy at `key` as of `now`.
    ///
    /// Returns `Ok(None)` if the policy no longer exists.
    #[instrument(skip_all, fields(policy = %key))]
    pub async fn reconcile_at(
        &self,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconcileReport>, ReconcileError> {
        let mut policy = match self.cluster.get_policy(key).await {
            Ok(policy) => policy,
            Err(e) if e.is_not_found() => {
                debug!("Policy not found, ignoring since it must have been deleted");
                return Ok(None);
            }
            Err(e) => return Err(ReconcileError::Fetch(e)),
        };

        let status = policy.status();
        if let Some(execution) = status.active_job {
            return Ok(Some(self.observe(&mut policy, execution, now).await));
        }

        match status.next_due_at() {
            Ok(Some(due)) if now < due => return Ok(Some(self.hold(&policy, due, now).await)),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Unparsable nextTransitionTime, treating policy as due"),
        }

        Ok(Some(self.evaluate(&mut policy, now).await))
    }

    /// Not due: keep the last desired count and re-converge after a success.
    async fn hold(&self, policy: &ScalingPolicy, due: DateTime<Utc>, now: DateTime<Utc>) -> ReconcileReport {
        let desired = last_known_desired(policy);
        let report = ReconcileReport::new(SchedulingState::NotDue, policy, desired, Requeue::at(due, now));

        let status = policy.status();
        if !status.last_outcome().is_some_and(Outcome::is_success) {
            return report;
        }

        match self
            .scaler
            .reconcile_target(policy.metadata.namespace(), &policy.spec.scale_target_ref, desired)
            .await
        {
            Ok(_) => report,
            Err(e) => {
                warn!(error = %e, desired, "Failed to re-converge scale target");
                let requeue = if e.is_retryable() {
                    Requeue::after(self.config.retry_interval.min(cronscale_reconcile::until(due, now)))
                } else {
                    report.requeue
                };
                ReconcileReport { requeue, ..report }.with_error(e)
            }
        }
    }

    /// Due: validate, submit and track an evaluation job.
    async fn evaluate(&self, policy: &mut ScalingPolicy, now: DateTime<Utc>) -> ReconcileReport {
        let next_tick = match schedule::next(&policy.spec.schedule, now) {
            Ok(next_tick) => next_tick,
            Err(e) => {
                let retry_at = self.retry_at(now);
                return self.fail(policy, now, e.into(), retry_at).await;
            }
        };

        if let Err(e) = check_kind(&policy.spec.scale_target_ref) {
            let next_at = self.failure_next_at(Some(next_tick), now);
            return self.fail(policy, now, e.into(), next_at).await;
        }

        let execution = match self.runner.submit(policy, now).await {
            Ok(execution) => execution,
            Err(e) => {
                let next_at = self.failure_next_at(Some(next_tick), now);
                return self.fail(policy, now, e.into(), next_at).await;
            }
        };

        let update = StatusUpdate::new().start_execution(execution.clone());
        if let Err(e) = self.recorder.record(policy, update).await {
            warn!(
                error = %e,
                job = %execution.name,
                "Failed to track submitted job; it will be resubmitted"
            );
            let desired = last_known_desired(policy);
            return ReconcileReport::new(
                SchedulingState::Due,
                policy,
                desired,
                Requeue::after(self.config.retry_interval),
            )
            .with_error(e);
        }

        self.observe(policy, execution, now).await
    }

    /// Observe the tracked job and consume it if finished.
    async fn observe(
        &self,
        policy: &mut ScalingPolicy,
        execution: JobExecution,
        now: DateTime<Utc>,
    ) -> ReconcileReport {
        let namespace = policy.metadata.namespace().to_string();
        let observation = self.runner.observe(&namespace, &execution, now).await;

        match observation {
            Observation::Pending | Observation::Running => {
                let phase = observation.phase();
                let mut report = ReconcileReport::new(
                    SchedulingState::Running,
                    policy,
                    last_known_desired(policy),
                    Requeue::after(self.config.poll_interval),
                );
                if phase != execution.phase {
                    debug!(job = %execution.name, %phase, "Job phase changed");
                    let update = StatusUpdate::new().start_execution(JobExecution { phase, ..execution });
                    match self.recorder.record(policy, update).await {
                        Ok(()) => report.resource_version = policy.metadata.resource_version.clone(),
                        Err(e) => report = report.with_error(e),
                    }
                }
                report
            }
            Observation::Succeeded(raw) => self.succeed(policy, execution, raw, now).await,
            Observation::Failed(e) => {
                let next_tick = schedule::next(&policy.spec.schedule, now).ok();
                let next_at = self.failure_next_at(next_tick, now);
                self.fail(policy, execution.started_at, e.into(), next_at).await
            }
        }
    }

    /// Consume a successful job: clamp, scale, record.
    async fn succeed(
        &self,
        policy: &mut ScalingPolicy,
        execution: JobExecution,
        raw: i32,
        now: DateTime<Utc>,
    ) -> ReconcileReport {
        let (min, max) = policy.spec.bounds();
        let desired = clamp_replicas(raw, min, max);
        let next_at = match schedule::next(&policy.spec.schedule, now) {
            Ok(next_at) => next_at,
            Err(e) => {
                warn!(error = %e, "Schedule no longer valid, retrying later");
                self.retry_at(now)
            }
        };

        let scaled = self
            .scaler
            .reconcile_target(policy.metadata.namespace(), &policy.spec.scale_target_ref, desired)
            .await;
        let current = match &scaled {
            Ok(result) => result.previous,
            Err(_) => last_known_desired(policy),
        };

        info!(job = %execution.name, raw, desired, min, max, "Evaluation succeeded");

        let outcome = Outcome {
            status: OutcomeStatus::Success,
            reason: String::new(),
            start_at: execution.started_at,
            next_at,
            current_replica: current,
            desired_replica: desired,
        };
        let update = StatusUpdate::new()
            .outcome(outcome)
            .next_at(next_at)
            .clear_execution();
        let recorded = self.recorder.record(policy, update).await;

        let mut report = ReconcileReport::new(
            SchedulingState::Succeeded,
            policy,
            desired,
            Requeue::at(next_at, now),
        );
        if let Err(e) = recorded {
            report.requeue = Requeue::after(self.config.retry_interval);
            return report.with_error(e);
        }
        if let Err(e) = scaled {
            warn!(error = %e, desired, "Failed to scale target");
            if e.is_retryable() {
                report.requeue = Requeue::after(self.config.retry_interval);
            }
            return report.with_error(e);
        }
        report
    }

    /// Record a failed evaluation; the target is left untouched.
    async fn fail(
        &self,
        policy: &mut ScalingPolicy,
        start_at: DateTime<Utc>,
        error: ReconcileError,
        next_at: DateTime<Utc>,
    ) -> ReconcileReport {
        let desired = last_known_desired(policy);
        warn!(error = %error, desired, next_at = %next_at, "Evaluation failed");

        let outcome = Outcome {
            status: OutcomeStatus::Failed,
            reason: error.to_string(),
            start_at,
            next_at,
            current_replica: desired,
            desired_replica: desired,
        };
        let update = StatusUpdate::new()
            .outcome(outcome)
            .next_at(next_at)
            .clear_execution();
        let recorded = self.recorder.record(policy, update).await;

        let report = ReconcileReport::new(
            SchedulingState::Failed,
            policy,
            desired,
            Requeue::after(self.config.retry_interval),
        );
        match recorded {
            Ok(()) => report.with_error(error),
            Err(e) => report.with_error(e),
        }
    }

    fn retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        later(now, self.config.retry_interval)
    }

    fn failure_next_at(&self, next_tick: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.config.failure_retry, next_tick) {
            (FailureRetry::NextTick, Some(next_tick)) => next_tick,
            (FailureRetry::NextTick, None) => self.retry_at(now),
            (FailureRetry::Fixed(delay), _) => later(now, delay),
        }
    }
}

/// Desired count of the latest outcome, or the floor if there is none.
fn last_known_desired(policy: &ScalingPolicy) -> i32 {
    policy
        .status()
        .last_desired()
        .unwrap_or_else(|| policy.spec.bounds().0)
}
