//! Job materialization from a policy's template.

use chrono::{DateTime, Utc};
use cronscale_resources::{Job, ScalingPolicy, POLICY_LABEL, RESTART_POLICY_NEVER};
use sha2::{Digest, Sha256};

use super::JobError;

/// `activeDeadlineSeconds` applied when the template leaves it unset.
pub const DEFAULT_ACTIVE_DEADLINE_SECONDS: i64 = 15;

/// `backoffLimit` applied when the template leaves it unset.
pub const DEFAULT_BACKOFF_LIMIT: i32 = 1;

const MAX_NAME_LEN: usize = 63;

/// Hex digits of the name digest kept when a policy name is truncated.
const NAME_HASH_LEN: usize = 8;

/// Unique, DNS-1123 compliant job name for an evaluation at `now`.
///
/// `<policy>-job-<yyyymmddhhmmss><millis>`. Policy names too long to fit in
/// 63 characters are cut and tagged with a digest of the full name, so two
/// policies sharing a long prefix still get distinct jobs.
pub fn job_name(policy: &str, now: DateTime<Utc>) -> String {
    let suffix = format!("-job-{}", now.format("%Y%m%d%H%M%S%3f"));
    let budget = MAX_NAME_LEN.saturating_sub(suffix.len());

    let sanitized: String = policy
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();

    let prefix = if sanitized.len() <= budget {
        sanitized.trim_end_matches('-').to_string()
    } else {
        let keep = budget.saturating_sub(NAME_HASH_LEN + 1);
        format!("{}-{}", sanitized[..keep].trim_end_matches('-'), name_hash(policy))
    };

    format!("{}{}", prefix, suffix)
}

fn name_hash(policy: &str) -> String {
    let digest = Sha256::digest(policy.as_bytes());
    hex::encode(&digest[..NAME_HASH_LEN / 2])
}

/// Build the job for one evaluation of `policy`.
///
/// Template values win; only unset fields are defaulted. The restart policy
/// is always `Never` so a failed container surfaces as a failed pod.
pub fn materialize(policy: &ScalingPolicy, now: DateTime<Utc>) -> Result<Job, JobError> {
    let owner = policy
        .controller_reference()
        .ok_or(JobError::OwnerReference)?;
    let policy_name = policy.metadata.name();
    let template = &policy.spec.job_template;

    let mut spec = template.spec.clone();
    spec.active_deadline_seconds
        .get_or_insert(DEFAULT_ACTIVE_DEADLINE_SECONDS);
    spec.backoff_limit.get_or_insert(DEFAULT_BACKOFF_LIMIT);
    spec.parallelism.get_or_insert(1);
    spec.completions.get_or_insert(1);
    spec.template.spec.restart_policy = Some(RESTART_POLICY_NEVER.to_string());
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .insert(POLICY_LABEL.to_string(), policy_name.to_string());

    let mut metadata = template.metadata.clone().unwrap_or_default();
    metadata.name = Some(job_name(policy_name, now));
    metadata.namespace = Some(policy.metadata.namespace().to_string());
    metadata.uid = None;
    metadata.resource_version = None;
    metadata
        .labels
        .insert(POLICY_LABEL.to_string(), policy_name.to_string());
    metadata.owner_references = vec![owner];

    Ok(Job::new(metadata, spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cronscale_resources::{
        JobSpec, JobTemplateSpec, ObjectMeta, ScaleTargetRef, ScalingPolicySpec,
    };

    fn policy(name: &str, spec: JobSpec) -> ScalingPolicy {
        let mut meta = ObjectMeta::named("default", name);
        meta.uid = Some("policy-uid".to_string());
        ScalingPolicy::new(
            meta,
            ScalingPolicySpec {
                scale_target_ref: ScaleTargetRef {
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                },
                min_replicas: 1,
                max_replicas: 5,
                schedule: "@hourly".to_string(),
                job_template: JobTemplateSpec {
                    metadata: None,
                    spec,
                },
            },
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap() + chrono::Duration::milliseconds(89)
    }

    #[test]
    fn test_job_name_format() {
        assert_eq!(job_name("web", now()), "web-job-20240304050607089");
    }

    #[test]
    fn test_job_name_truncates_long_parents() {
        let name = job_name(&"a".repeat(80), now());
        assert_eq!(name.len(), 63);
        assert!(name.starts_with(&"a".repeat(32)));
        assert!(name.ends_with("-job-20240304050607089"));
        assert_eq!(name, job_name(&"a".repeat(80), now()));
    }

    #[test]
    fn test_job_name_distinguishes_shared_long_prefixes() {
        let alpha = job_name("orders-service-horizontal-scaler-production-alpha", now());
        let bravo = job_name("orders-service-horizontal-scaler-production-bravo", now());

        assert_ne!(alpha, bravo);
        for name in [&alpha, &bravo] {
            assert!(name.len() <= 63, "{} is too long", name);
            assert!(name.starts_with("orders-service-horizontal-scaler-"));
            assert!(name.ends_with("-job-20240304050607089"));
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        }
    }

    #[test]
    fn test_job_name_fits_exactly_without_digest() {
        let policy = "b".repeat(41);
        assert_eq!(job_name(&policy, now()), format!("{}-job-20240304050607089", policy));
    }

    #[test]
    fn test_job_name_is_dns_label() {
        let name = job_name("My.Policy_", now());
        assert_eq!(name, "my-policy-job-20240304050607089");
    }

    #[test]
    fn test_materialize_applies_defaults() {
        let job = materialize(&policy("web", JobSpec::default()), now()).unwrap();

        assert_eq!(job.spec.active_deadline_seconds, Some(15));
        assert_eq!(job.spec.backoff_limit, Some(1));
        assert_eq!(job.spec.parallelism, Some(1));
        assert_eq!(job.spec.completions, Some(1));
        assert_eq!(job.spec.template.spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(job.metadata.namespace(), "default");
        assert_eq!(job.metadata.labels.get(POLICY_LABEL).map(String::as_str), Some("web"));

        let owner = job.metadata.controller_owner().unwrap();
        assert_eq!(owner.uid, "policy-uid");
        assert_eq!(owner.name, "web");
    }

    #[test]
    fn test_materialize_keeps_template_values() {
        let mut spec = JobSpec {
            active_deadline_seconds: Some(120),
            backoff_limit: Some(4),
            ..Default::default()
        };
        spec.template.spec.restart_policy = Some("OnFailure".to_string());

        let job = materialize(&policy("web", spec), now()).unwrap();
        assert_eq!(job.spec.active_deadline_seconds, Some(120));
        assert_eq!(job.spec.backoff_limit, Some(4));
        assert_eq!(job.spec.template.spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn test_materialize_requires_persisted_policy() {
        let mut unsaved = policy("web", JobSpec::default());
        unsaved.metadata.uid = None;
        assert!(matches!(
            materialize(&unsaved, now()),
            Err(JobError::OwnerReference)
        ));
    }
}
