//! Reconcile dispatcher.
//!
//! Lists policies on a fixed tick and reconciles the ones that are due:
//! never seen before, past the wake-up time from their last report, or
//! changed since (a `resourceVersion` the worker did not write). Due
//! policies run concurrently; every reconcile is joined before the next
//! tick so a policy never has two reconciles in flight.
//!
//! A policy whose status keeps failing to persist is escalated to `error!`
//! and then backed off to a multiple of the retry interval until it
//! recovers or its failure window lapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cronscale_reconcile::{later, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
use cronscale_resources::ObjectKey;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::ClusterApi;
use crate::reconciler::{ReconcileError, ReconcileReport, Reconciler};

/// Retry interval multiplier for policies whose retries are exhausted.
pub const EXHAUSTED_BACKOFF_FACTOR: u32 = 4;

/// Dispatcher state for one policy.
#[derive(Debug, Clone)]
struct Entry {
    wake_at: DateTime<Utc>,
    resource_version: Option<String>,
}

/// Statistics from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub listed: usize,
    pub reconciled: usize,
    pub failed: usize,
}

/// Periodic dispatcher for [`Reconciler`].
pub struct ReconcileWorker {
    cluster: Arc<dyn ClusterApi>,
    reconciler: Arc<Reconciler>,
    namespace: Option<String>,
    interval: Duration,
    entries: HashMap<ObjectKey, Entry>,
    retries: RetryTracker<ObjectKey>,
}

impl ReconcileWorker {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        reconciler: Reconciler,
        namespace: Option<String>,
        interval: Duration,
    ) -> Self {
        Self {
            cluster,
            reconciler: Arc::new(reconciler),
            namespace,
            interval,
            entries: HashMap::new(),
            retries: RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW),
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            namespace = self.namespace.as_deref().unwrap_or("*"),
            "Starting reconcile worker"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.run_pass().await;
                    if stats.reconciled > 0 {
                        debug!(
                            listed = stats.listed,
                            reconciled = stats.reconciled,
                            failed = stats.failed,
                            "Dispatch pass complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single dispatch pass as of now.
    pub async fn run_pass(&mut self) -> PassStats {
        self.run_pass_at(Utc::now()).await
    }

    /// Run a single dispatch pass as of `now`.
    pub async fn run_pass_at(&mut self, now: DateTime<Utc>) -> PassStats {
        let policies = match self.cluster.list_policies(self.namespace.as_deref()).await {
            Ok(policies) => policies,
            Err(e) => {
                warn!(error = %e, "Failed to list policies");
                return PassStats::default();
            }
        };

        let mut stats = PassStats {
            listed: policies.len(),
            ..Default::default()
        };

        let mut listed = HashMap::with_capacity(policies.len());
        for policy in policies {
            listed.insert(policy.metadata.key(), policy.metadata.resource_version);
        }
        self.entries.retain(|key, _| listed.contains_key(key));
        self.retries.prune(Instant::now());

        let mut tasks = JoinSet::new();
        for (key, resource_version) in &listed {
            let due = match self.entries.get(key) {
                None => true,
                Some(entry) => entry.wake_at <= now || entry.resource_version != *resource_version,
            };
            if !due {
                continue;
            }

            let reconciler = self.reconciler.clone();
            let key = key.clone();
            tasks.spawn(async move {
                let result = reconciler.reconcile_at(&key, now).await;
                (key, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (key, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Reconcile task panicked");
                    stats.failed += 1;
                    continue;
                }
            };
            stats.reconciled += 1;

            match result {
                Ok(Some(report)) => {
                    if report.error.is_some() {
                        stats.failed += 1;
                    }
                    self.handle_report(&key, report, now);
                }
                Ok(None) => {
                    self.entries.remove(&key);
                    self.retries.clear(&key);
                }
                Err(e) => {
                    stats.failed += 1;
                    self.handle_error(&key, &e, listed.get(&key).cloned().flatten(), now);
                }
            }
        }

        stats
    }

    fn handle_report(&mut self, key: &ObjectKey, report: ReconcileReport, now: DateTime<Utc>) {
        match &report.error {
            Some(e) if e.is_status() => self.escalate(key, e),
            Some(_) => {}
            None => self.retries.clear(key),
        }

        let delay = self.backoff(key, report.requeue_after());
        let wake_at = later(now, delay);

        debug!(
            policy = %key,
            state = %report.state,
            desired = report.desired,
            requeue_ms = delay.as_millis() as u64,
            "Reconciled policy"
        );

        self.entries.insert(
            key.clone(),
            Entry {
                wake_at,
                resource_version: report.resource_version,
            },
        );
    }

    fn handle_error(
        &mut self,
        key: &ObjectKey,
        err: &ReconcileError,
        resource_version: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.escalate(key, err);
        let delay = self.backoff(key, self.reconciler.config().retry_interval);
        self.entries.insert(
            key.clone(),
            Entry {
                wake_at: later(now, delay),
                resource_version,
            },
        );
    }

    /// Stretch `delay` for a policy whose retries are exhausted.
    fn backoff(&self, key: &ObjectKey, delay: Duration) -> Duration {
        if !self.retries.is_exhausted(key, Instant::now()) {
            return delay;
        }
        let floor = self
            .reconciler
            .config()
            .retry_interval
            .saturating_mul(EXHAUSTED_BACKOFF_FACTOR);
        delay.max(floor)
    }

    /// Log a persistent failure, escalating once retries are exhausted.
    fn escalate(&mut self, key: &ObjectKey, err: &ReconcileError) {
        if self.retries.record_failure(key.clone(), Instant::now()) {
            error!(policy = %key, error = %err, "Policy repeatedly failing to reconcile");
        } else {
            warn!(policy = %key, error = %err, "Reconcile failed, will retry");
        }
    }

    /// Keys the worker is currently tracking.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
