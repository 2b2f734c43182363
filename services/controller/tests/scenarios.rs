//! End-to-end reconcile scenarios against the in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cronscale_controller::cluster::{ClusterError, JobScript, MemoryCluster, Operation};
use cronscale_controller::reconciler::{
    FailureRetry, ReconcileError, ReconcileReport, Reconciler, ReconcilerConfig, SchedulingState,
};
use cronscale_controller::scaler::ScaleError;
use cronscale_reconcile::Requeue;
use cronscale_resources::{
    Deployment, JobTemplateSpec, ObjectKey, ObjectMeta, OutcomeStatus, ScaleTargetRef,
    ScalingPolicy, ScalingPolicySpec, ScalingPolicyStatus, HISTORY_LIMIT,
};
use rstest::rstest;

struct Harness {
    cluster: Arc<MemoryCluster>,
    reconciler: Reconciler,
    key: ObjectKey,
}

impl Harness {
    async fn new(kind: &str, schedule: &str, script: JobScript) -> Self {
        Self::with_config(kind, schedule, script, ReconcilerConfig::default()).await
    }

    async fn with_config(
        kind: &str,
        schedule: &str,
        script: JobScript,
        config: ReconcilerConfig,
    ) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_job_script(script).await;
        cluster
            .insert_deployment(Deployment::new(ObjectMeta::named("default", "web"), Some(2)))
            .await;
        let policy = cluster
            .insert_policy(ScalingPolicy::new(
                ObjectMeta::named("default", "web-scaler"),
                ScalingPolicySpec {
                    scale_target_ref: ScaleTargetRef {
                        kind: kind.to_string(),
                        name: "web".to_string(),
                    },
                    min_replicas: 2,
                    max_replicas: 10,
                    schedule: schedule.to_string(),
                    job_template: JobTemplateSpec::default(),
                },
            ))
            .await;

        Self {
            reconciler: Reconciler::new(cluster.clone(), config),
            key: policy.metadata.key(),
            cluster,
        }
    }

    async fn reconcile(&self, now: DateTime<Utc>) -> ReconcileReport {
        self.reconciler
            .reconcile_at(&self.key, now)
            .await
            .unwrap()
            .unwrap()
    }

    async fn status(&self) -> ScalingPolicyStatus {
        self.cluster.policy(&self.key).await.unwrap().status()
    }

    async fn replicas(&self) -> Option<i32> {
        self.cluster
            .deployment(&ObjectKey::new("default", "web"))
            .await
            .unwrap()
            .spec
            .replicas
    }

    async fn set_replicas(&self, replicas: i32) {
        self.cluster
            .insert_deployment(Deployment::new(
                ObjectMeta::named("default", "web"),
                Some(replicas),
            ))
            .await;
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

#[tokio::test]
async fn first_evaluation_scales_to_job_result() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("7\n")).await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Succeeded);
    assert_eq!(report.desired, 7);
    assert!(report.error.is_none());
    assert_eq!(report.requeue, Requeue::after(Duration::from_secs(3600)));

    let status = h.status().await;
    assert_eq!(status.replication_status.len(), 1);
    let outcome = status.last_outcome().unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.current_replica, 2);
    assert_eq!(outcome.desired_replica, 7);
    assert_eq!(outcome.start_at, now());
    assert_eq!(status.next_due_at().unwrap(), Some(now() + secs(3600)));
    assert_eq!(status.active_job, None);

    assert_eq!(h.replicas().await, Some(7));
    assert_eq!(h.cluster.jobs().await.len(), 1);
}

#[rstest]
#[case("42", 10)]
#[case("7", 7)]
#[case("0", 2)]
#[case("-5", 2)]
#[tokio::test]
async fn job_result_is_clamped(#[case] output: &str, #[case] expected: i32) {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed(output)).await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.desired, expected);
    assert_eq!(h.status().await.last_desired(), Some(expected));
    assert_eq!(h.replicas().await, Some(expected));
}

#[tokio::test]
async fn timed_out_job_keeps_previous_desired() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::Hang).await;
    h.set_replicas(3).await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Running);
    assert_eq!(report.requeue, Requeue::after(Duration::from_secs(1)));
    assert!(h.status().await.active_job.is_some());

    // Still inside deadline plus grace: keep waiting, no resubmission.
    let report = h.reconcile(now() + secs(10)).await;
    assert_eq!(report.state, SchedulingState::Running);
    assert_eq!(h.cluster.jobs().await.len(), 1);

    let report = h.reconcile(now() + secs(21)).await;
    assert_eq!(report.state, SchedulingState::Failed);
    assert_eq!(report.desired, 2);
    assert_eq!(report.requeue, Requeue::after(Duration::from_secs(15)));
    assert!(matches!(
        report.error,
        Some(ReconcileError::Job(ref e)) if e.to_string().contains("did not finish")
    ));

    let status = h.status().await;
    let outcome = status.last_outcome().unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.desired_replica, 2);
    assert!(!outcome.reason.is_empty());
    assert_eq!(status.active_job, None);
    assert_eq!(status.next_due_at().unwrap(), Some(now() + secs(21) + secs(3600)));

    assert_eq!(h.replicas().await, Some(3));
    assert_eq!(h.cluster.write_count(Operation::UpdateDeployment).await, 0);
}

#[tokio::test]
async fn huge_template_deadline_keeps_policy_observable() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::Hang).await;
    h.cluster
        .edit_policy(&h.key, |p| {
            p.spec.job_template.spec.active_deadline_seconds = Some(i64::MAX)
        })
        .await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Running);
    assert!(report.error.is_none());

    let report = h.reconcile(now() + chrono::Duration::days(30)).await;
    assert_eq!(report.state, SchedulingState::Running);
    assert_eq!(h.cluster.jobs().await.len(), 1);

    // A tracked deadline too large to add to a timestamp is not enforced locally.
    h.cluster
        .edit_policy(&h.key, |p| {
            if let Some(job) = p.status_mut().active_job.as_mut() {
                job.deadline_seconds = i64::MAX;
            }
        })
        .await;
    let report = h.reconcile(now() + chrono::Duration::days(60)).await;
    assert_eq!(report.state, SchedulingState::Running);
    assert_eq!(h.status().await.active_job.unwrap().deadline_seconds, i64::MAX);
}

#[tokio::test]
async fn unsupported_kind_records_failure_without_job() {
    let h = Harness::new("StatefulSet", "@every 1h", JobScript::succeed("7")).await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Failed);
    assert_eq!(report.desired, 2);
    assert!(matches!(
        report.error,
        Some(ReconcileError::Scale(ScaleError::UnsupportedKind { .. }))
    ));

    let status = h.status().await;
    let outcome = status.last_outcome().unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert!(outcome.reason.contains("StatefulSet"));

    assert!(h.cluster.jobs().await.is_empty());
    assert_eq!(h.replicas().await, Some(2));
}

#[rstest]
#[case("deployment")]
#[case("DEPLOYMENT")]
#[case("deploy")]
#[tokio::test]
async fn supported_kind_spellings_are_accepted(#[case] kind: &str) {
    let h = Harness::new(kind, "@every 1h", JobScript::succeed("5")).await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Succeeded);
    assert_eq!(h.replicas().await, Some(5));
}

#[tokio::test]
async fn not_due_returns_previous_desired_without_job() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("7")).await;
    h.reconcile(now()).await;
    let writes = h.cluster.writes().await.len();

    let report = h.reconcile(now() + secs(1)).await;
    assert_eq!(report.state, SchedulingState::NotDue);
    assert_eq!(report.desired, 7);
    assert_eq!(report.requeue, Requeue::after(Duration::from_secs(3599)));
    assert!(report.error.is_none());

    assert_eq!(h.cluster.jobs().await.len(), 1);
    assert_eq!(h.cluster.writes().await.len(), writes);
}

#[tokio::test]
async fn history_keeps_most_recent_outcomes() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("4")).await;

    for i in 0..15 {
        let report = h.reconcile(now() + secs(i * 3601)).await;
        assert_eq!(report.state, SchedulingState::Succeeded);
    }

    let status = h.status().await;
    assert_eq!(status.replication_status.len(), HISTORY_LIMIT);
    assert_eq!(h.cluster.jobs().await.len(), 15);

    let starts: Vec<_> = status.replication_status.iter().map(|o| o.start_at).collect();
    let expected: Vec<_> = (5..15).map(|i| now() + secs(i * 3601)).collect();
    assert_eq!(starts, expected);
}

#[tokio::test]
async fn equal_replicas_are_not_rewritten() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("2")).await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.desired, 2);
    assert_eq!(h.cluster.write_count(Operation::UpdateDeployment).await, 0);
}

#[tokio::test]
async fn not_due_reconverges_after_success() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("7")).await;
    h.reconcile(now()).await;

    h.set_replicas(3).await;
    let report = h.reconcile(now() + secs(60)).await;
    assert_eq!(report.state, SchedulingState::NotDue);
    assert_eq!(h.replicas().await, Some(7));
    assert_eq!(h.cluster.jobs().await.len(), 1);
}

#[tokio::test]
async fn not_due_after_failure_leaves_target_alone() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::fail("BackoffLimitExceeded")).await;
    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Failed);

    h.set_replicas(3).await;
    let report = h.reconcile(now() + secs(60)).await;
    assert_eq!(report.state, SchedulingState::NotDue);
    assert_eq!(report.desired, 2);
    assert_eq!(h.replicas().await, Some(3));
    assert_eq!(h.cluster.write_count(Operation::UpdateDeployment).await, 0);
}

#[tokio::test]
async fn failure_waits_for_next_tick_by_default() {
    let h = Harness::new("Deployment", "0 * * * *", JobScript::fail("BackoffLimitExceeded")).await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Failed);
    assert_eq!(
        h.status().await.next_due_at().unwrap(),
        Some(now() + secs(3600))
    );

    let report = h.reconcile(now() + secs(30)).await;
    assert_eq!(report.state, SchedulingState::NotDue);
    assert_eq!(h.cluster.jobs().await.len(), 1);
}

#[tokio::test]
async fn failure_retries_after_fixed_delay() {
    let config = ReconcilerConfig {
        failure_retry: FailureRetry::Fixed(Duration::from_secs(30)),
        ..ReconcilerConfig::default()
    };
    let h = Harness::with_config(
        "Deployment",
        "0 * * * *",
        JobScript::fail("BackoffLimitExceeded"),
        config,
    )
    .await;

    h.reconcile(now()).await;
    assert_eq!(
        h.status().await.next_due_at().unwrap(),
        Some(now() + secs(30))
    );

    h.cluster.set_job_script(JobScript::succeed("6")).await;
    let report = h.reconcile(now() + secs(30)).await;
    assert_eq!(report.state, SchedulingState::Succeeded);
    assert_eq!(report.desired, 6);
    assert_eq!(h.cluster.jobs().await.len(), 2);
}

#[tokio::test]
async fn in_flight_job_survives_restart() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::Hang).await;
    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Running);

    let job = h.cluster.jobs().await.remove(0);
    h.cluster
        .rescript_job(&job.metadata.key(), JobScript::succeed("8"))
        .await;

    // A fresh reconciler has no memory of the submission.
    let restarted = Reconciler::new(h.cluster.clone(), ReconcilerConfig::default());
    let report = restarted
        .reconcile_at(&h.key, now() + secs(3))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.state, SchedulingState::Succeeded);
    assert_eq!(report.desired, 8);
    assert_eq!(h.cluster.jobs().await.len(), 1);
    assert_eq!(h.status().await.last_outcome().unwrap().start_at, now());
}

#[tokio::test]
async fn invalid_schedule_is_recorded_and_retried() {
    let h = Harness::new("Deployment", "every now and then", JobScript::succeed("7")).await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Failed);
    assert!(matches!(report.error, Some(ReconcileError::Schedule(_))));
    assert!(h.cluster.jobs().await.is_empty());

    let status = h.status().await;
    assert!(status.last_outcome().unwrap().reason.contains("invalid schedule"));
    assert_eq!(status.next_due_at().unwrap(), Some(now() + secs(15)));
}

#[tokio::test]
async fn malformed_output_is_a_failure() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("lots\n")).await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Failed);
    assert!(h
        .status()
        .await
        .last_outcome()
        .unwrap()
        .reason
        .contains("parse"));
    assert_eq!(h.replicas().await, Some(2));
}

#[tokio::test]
async fn unparsable_next_transition_time_is_due() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("5")).await;
    h.cluster
        .edit_policy(&h.key, |p| {
            p.status_mut().next_transition_time = Some("2024-06-01 13:00:00 +0000 UTC".into())
        })
        .await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Succeeded);
    assert_eq!(h.cluster.jobs().await.len(), 1);
}

#[tokio::test]
async fn missing_target_is_retried_after_success() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("5")).await;
    h.cluster
        .fail_next(
            Operation::GetDeployment,
            ClusterError::not_found("Deployment", &ObjectKey::new("default", "web")),
        )
        .await;

    let report = h.reconcile(now()).await;
    assert_eq!(report.state, SchedulingState::Succeeded);
    assert!(matches!(
        report.error,
        Some(ReconcileError::Scale(ScaleError::NotFound { .. }))
    ));
    assert_eq!(report.requeue, Requeue::after(Duration::from_secs(15)));
    assert_eq!(h.status().await.last_desired(), Some(5));

    let report = h.reconcile(now() + secs(15)).await;
    assert_eq!(report.state, SchedulingState::NotDue);
    assert_eq!(h.replicas().await, Some(5));
}

#[tokio::test]
async fn deleted_policy_is_ignored() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("5")).await;
    h.cluster.delete_policy(&h.key).await;

    let result = h.reconciler.reconcile_at(&h.key, now()).await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn status_conflict_is_reported_not_fatal() {
    let h = Harness::new("Deployment", "@every 1h", JobScript::succeed("5")).await;
    h.cluster
        .fail_next(
            Operation::UpdatePolicyStatus,
            ClusterError::Conflict("the object has been modified".into()),
        )
        .await;

    let report = h.reconcile(now()).await;
    assert!(matches!(report.error, Some(ReconcileError::Status(_))));
    assert_eq!(report.requeue, Requeue::after(Duration::from_secs(15)));
    assert_eq!(h.status().await.active_job, None);

    // The next pass evaluates again; the duplicate job gets its own name.
    let report = h.reconcile(now() + secs(1)).await;
    assert_eq!(report.state, SchedulingState::Succeeded);
    assert_eq!(h.cluster.jobs().await.len(), 2);
}
