//! Kubernetes API server client over REST.
//!
//! Uses the in-cluster service account by default: bearer token read from a
//! file on every request (so rotated tokens are picked up) and the cluster
//! CA bundle added as a trusted root.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use cronscale_resources::{Deployment, Job, ObjectKey, Pod, ScalingPolicy, GROUP, PLURAL};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{ClusterApi, ClusterError, ClusterResult};

const POLICY_VERSION: &str = "v1";

/// Connection settings for [`HttpCluster`].
#[derive(Debug, Clone)]
pub struct HttpClusterConfig {
    /// API server base URL, e.g. `https://kubernetes.default.svc`.
    pub api_url: String,

    /// File holding the bearer token.
    pub token_path: Option<PathBuf>,

    /// PEM bundle of the API server's CA.
    pub ca_path: Option<PathBuf>,

    pub timeout: Duration,
}

impl Default for HttpClusterConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            token_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            ca_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct List<T> {
    items: Vec<T>,
}

/// [`ClusterApi`] backed by a Kubernetes API server.
pub struct HttpCluster {
    client: reqwest::Client,
    base_url: String,
    token_path: Option<PathBuf>,
}

impl HttpCluster {
    /// Build a client, loading the CA bundle if configured.
    pub fn new(config: &HttpClusterConfig) -> ClusterResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);

        if let Some(ca_path) = &config.ca_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                ClusterError::Transport(format!("reading CA bundle {}: {}", ca_path.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ClusterError::Transport(format!("parsing CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| ClusterError::Transport(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token_path: config.token_path.clone(),
        })
    }

    fn policies_url(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!(
                "{}/apis/{}/{}/namespaces/{}/{}",
                self.base_url, GROUP, POLICY_VERSION, ns, PLURAL
            ),
            None => format!("{}/apis/{}/{}/{}", self.base_url, GROUP, POLICY_VERSION, PLURAL),
        }
    }

    fn policy_url(&self, key: &ObjectKey) -> String {
        format!("{}/{}", self.policies_url(Some(&key.namespace)), key.name)
    }

    fn deployment_url(&self, key: &ObjectKey) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}",
            self.base_url, key.namespace, key.name
        )
    }

    fn jobs_url(&self, namespace: &str) -> String {
        format!("{}/apis/batch/v1/namespaces/{}/jobs", self.base_url, namespace)
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, namespace)
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> ClusterResult<reqwest::RequestBuilder> {
        let Some(path) = &self.token_path else {
            return Ok(request);
        };
        let token = tokio::fs::read_to_string(path).await.map_err(|e| {
            ClusterError::Transport(format!("reading token {}: {}", path.display(), e))
        })?;
        Ok(request.bearer_auth(token.trim()))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        kind: &'static str,
        key: &ObjectKey,
    ) -> ClusterResult<reqwest::Response> {
        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            404 => Err(ClusterError::not_found(kind, key)),
            409 => Err(ClusterError::Conflict(body)),
            422 => Err(ClusterError::Invalid(body)),
            code => {
                error!(status = %status, body = %body, kind, key = %key, "API request failed");
                Err(ClusterError::Api {
                    status: code,
                    message: body,
                })
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        kind: &'static str,
        key: &ObjectKey,
    ) -> ClusterResult<T> {
        debug!(url = %url, "GET");
        let response = self.send(self.client.get(url), kind, key).await?;
        decode(response).await
    }

    async fn write_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        body: &B,
        kind: &'static str,
        key: &ObjectKey,
    ) -> ClusterResult<T> {
        let response = self.send(request.json(body), kind, key).await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ClusterResult<T> {
    response
        .json()
        .await
        .map_err(|e| ClusterError::Transport(format!("decoding response: {}", e)))
}

#[async_trait]
impl ClusterApi for HttpCluster {
    async fn list_policies(&self, namespace: Option<&str>) -> ClusterResult<Vec<ScalingPolicy>> {
        let url = self.policies_url(namespace);
        let scope = ObjectKey::new(namespace.unwrap_or_default(), "");
        let list: List<ScalingPolicy> = self.get_json(&url, "ScalingPolicyList", &scope).await?;
        Ok(list.items)
    }

    async fn get_policy(&self, key: &ObjectKey) -> ClusterResult<ScalingPolicy> {
        self.get_json(&self.policy_url(key), "ScalingPolicy", key)
            .await
    }

    async fn update_policy_status(&self, policy: &ScalingPolicy) -> ClusterResult<ScalingPolicy> {
        let key = policy.metadata.key();
        let url = format!("{}/status", self.policy_url(&key));
        debug!(policy = %key, "PUT status");
        self.write_json(self.client.put(&url), policy, "ScalingPolicy", &key)
            .await
    }

    async fn get_deployment(&self, key: &ObjectKey) -> ClusterResult<Deployment> {
        self.get_json(&self.deployment_url(key), "Deployment", key)
            .await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> ClusterResult<Deployment> {
        let key = deployment.metadata.key();
        let url = self.deployment_url(&key);
        debug!(deployment = %key, "PUT deployment");
        self.write_json(self.client.put(&url), deployment, "Deployment", &key)
            .await
    }

    async fn create_job(&self, job: &Job) -> ClusterResult<Job> {
        let key = job.metadata.key();
        let url = self.jobs_url(&key.namespace);
        debug!(job = %key, "POST job");
        self.write_json(self.client.post(&url), job, "Job", &key)
            .await
    }

    async fn get_job(&self, key: &ObjectKey) -> ClusterResult<Job> {
        let url = format!("{}/{}", self.jobs_url(&key.namespace), key.name);
        self.get_json(&url, "Job", key).await
    }

    async fn list_pods(&self, namespace: &str, selector: (&str, &str)) -> ClusterResult<Vec<Pod>> {
        let url = self.pods_url(namespace);
        let scope = ObjectKey::new(namespace, "");
        let request = self
            .client
            .get(&url)
            .query(&[("labelSelector", format!("{}={}", selector.0, selector.1))]);
        let response = self.send(request, "PodList", &scope).await?;
        let list: List<Pod> = decode(response).await?;
        Ok(list.items)
    }

    async fn stream_output(&self, pod: &ObjectKey, tail_lines: i64) -> ClusterResult<Vec<u8>> {
        let url = format!("{}/{}/log", self.pods_url(&pod.namespace), pod.name);
        let request = self
            .client
            .get(&url)
            .query(&[("tailLines", tail_lines.to_string())]);
        let response = self.send(request, "Pod", pod).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> HttpCluster {
        HttpCluster::new(&HttpClusterConfig {
            api_url: "https://api.example:6443/".to_string(),
            token_path: None,
            ca_path: None,
            timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[test]
    fn test_resource_urls() {
        let cluster = cluster();
        let key = ObjectKey::new("prod", "web");

        assert_eq!(
            cluster.policies_url(None),
            "https://api.example:6443/apis/cronscale.io/v1/scalingpolicies"
        );
        assert_eq!(
            cluster.policy_url(&key),
            "https://api.example:6443/apis/cronscale.io/v1/namespaces/prod/scalingpolicies/web"
        );
        assert_eq!(
            cluster.deployment_url(&key),
            "https://api.example:6443/apis/apps/v1/namespaces/prod/deployments/web"
        );
        assert_eq!(
            cluster.jobs_url("prod"),
            "https://api.example:6443/apis/batch/v1/namespaces/prod/jobs"
        );
        assert_eq!(
            cluster.pods_url("prod"),
            "https://api.example:6443/api/v1/namespaces/prod/pods"
        );
    }

    #[test]
    fn test_missing_ca_bundle_is_reported() {
        let result = HttpCluster::new(&HttpClusterConfig {
            ca_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            token_path: None,
            ..Default::default()
        });
        assert!(matches!(result, Err(ClusterError::Transport(_))));
    }
}
