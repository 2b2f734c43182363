//! Configuration for the controller.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cluster::HttpClusterConfig;
use crate::reconciler::{FailureRetry, ReconcilerConfig};

/// Which cluster backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    Kubernetes,

    /// In-process store; nothing outside the process is touched.
    Memory,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,

    pub cluster: ClusterMode,

    /// API server connection (used in Kubernetes mode).
    pub http: HttpClusterConfig,

    /// Namespace to watch; all namespaces if unset.
    pub namespace: Option<String>,

    /// Dispatcher tick.
    pub tick_interval: Duration,

    pub reconciler: ReconcilerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = var("CRONSCALE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let cluster = match var("CRONSCALE_CLUSTER").as_deref() {
            None | Some("kubernetes") => ClusterMode::Kubernetes,
            Some("memory") => ClusterMode::Memory,
            Some(other) => bail!("CRONSCALE_CLUSTER must be kubernetes or memory, got {:?}", other),
        };

        let defaults = HttpClusterConfig::default();
        let api_url = var("CRONSCALE_API_URL")
            .or_else(|| {
                let host = var("KUBERNETES_SERVICE_HOST")?;
                let port = var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|| "443".to_string());
                Some(format!("https://{}:{}", host, port))
            })
            .unwrap_or(defaults.api_url);
        let token_path = var("CRONSCALE_TOKEN_PATH")
            .map(PathBuf::from)
            .or(defaults.token_path);
        let ca_path = var("CRONSCALE_CA_PATH").map(PathBuf::from).or(defaults.ca_path);

        let namespace = var("CRONSCALE_NAMESPACE").filter(|ns| !ns.is_empty());

        let tick_interval = Duration::from_secs(parse_secs(&var, "CRONSCALE_TICK_INTERVAL_SECS", 1)?);
        let retry_interval =
            Duration::from_secs(parse_secs(&var, "CRONSCALE_RETRY_INTERVAL_SECS", 15)?);

        let failure_retry = match var("CRONSCALE_FAILURE_RETRY") {
            Some(raw) => raw
                .parse::<FailureRetry>()
                .map_err(anyhow::Error::msg)
                .context("CRONSCALE_FAILURE_RETRY")?,
            None => FailureRetry::default(),
        };

        Ok(Self {
            log_level,
            cluster,
            http: HttpClusterConfig {
                api_url,
                token_path,
                ca_path,
                timeout: defaults.timeout,
            },
            namespace,
            tick_interval,
            reconciler: ReconcilerConfig {
                retry_interval,
                failure_retry,
                ..ReconcilerConfig::default()
            },
        })
    }
}

fn parse_secs(var: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<u64> {
    let Some(raw) = var(name) else {
        return Ok(default);
    };
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds, got {:?}", name, raw))?;
    if secs == 0 {
        bail!("{} must be positive", name);
    }
    Ok(secs)
}
