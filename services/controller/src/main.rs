//! cronscale controller
//!
//! Runs cron-scheduled evaluation jobs for every `ScalingPolicy` and scales
//! each policy's target to the replica count its job prints.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cronscale_controller::cluster::{ClusterApi, HttpCluster, MemoryCluster};
use cronscale_controller::config::{ClusterMode, Config};
use cronscale_controller::reconciler::Reconciler;
use cronscale_controller::worker::ReconcileWorker;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cronscale controller");
    info!(
        cluster = ?config.cluster,
        api_url = %config.http.api_url,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        tick_interval_secs = config.tick_interval.as_secs(),
        retry_interval_secs = config.reconciler.retry_interval.as_secs(),
        failure_retry = %config.reconciler.failure_retry,
        "Configuration loaded"
    );

    let cluster: Arc<dyn ClusterApi> = match config.cluster {
        ClusterMode::Kubernetes => Arc::new(HttpCluster::new(&config.http)?),
        ClusterMode::Memory => Arc::new(MemoryCluster::new()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(cluster.clone(), config.reconciler.clone());
    let worker = ReconcileWorker::new(
        cluster,
        reconciler,
        config.namespace.clone(),
        config.tick_interval,
    );
    let mut worker_handle = tokio::spawn(worker.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconcile worker panicked");
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for reconcile worker to shut down...");
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Reconcile worker panicked");
    }

    info!("Controller shutdown complete");
    Ok(())
}
