// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes backend.
//!
//! Runs each job as a bare pod (`restartPolicy: Never`) through the core/v1
//! pods REST API. Inside a cluster the API address, bearer token, CA bundle
//! and namespace come from the service-account mount.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::traits::*;
use crate::phase::{KUBERNETES_PHASES, PhaseVocabulary};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Connection settings for the Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// API server base URL, e.g. `https://10.0.0.1:443`.
    pub api_server: String,
    /// Namespace pods are created in.
    pub namespace: String,
    /// Bearer token.
    pub token: Option<String>,
    /// PEM-encoded cluster CA certificate.
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Skip TLS verification (development clusters only).
    pub accept_invalid_certs: bool,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".to_string(),
            namespace: "default".to_string(),
            token: None,
            ca_cert_pem: None,
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl KubernetesConfig {
    /// Settings from the in-cluster service-account mount.
    ///
    /// Missing files are not errors: the token and CA are simply left unset
    /// so an out-of-cluster proxy (`kubectl proxy`) still works.
    pub fn in_cluster() -> Self {
        let mut config = Self::default();

        if let (Ok(host), Ok(port)) = (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) {
            config.api_server = format!("https://{}:{}", host, port);
        }

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        config.token = std::fs::read_to_string(dir.join("token"))
            .ok()
            .map(|t| t.trim().to_string());
        config.ca_cert_pem = std::fs::read(dir.join("ca.crt")).ok();
        if let Ok(namespace) = std::fs::read_to_string(dir.join("namespace")) {
            config.namespace = namespace.trim().to_string();
        }

        config
    }
}

/// Backend running jobs as Kubernetes pods.
pub struct KubernetesBackend {
    client: Client,
    config: KubernetesConfig,
}

impl KubernetesBackend {
    /// Build the HTTP client for the configured API server.
    pub fn new(config: KubernetesConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(pem) = &config.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| BackendError::Other(format!("invalid cluster CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| BackendError::Other(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn pods_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods",
            self.config.api_server.trim_end_matches('/'),
            self.config.namespace
        )
    }

    fn pod_url(&self, name: &str) -> String {
        format!("{}/{}", self.pods_url(), name)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request for an existing pod and classify failures.
    async fn send_for_pod(&self, name: &str, request: RequestBuilder) -> Result<Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::JobNotFound(name.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!("{} {}", status, api_message(&body));
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(BackendError::Unreachable(detail))
        } else {
            Err(BackendError::Other(detail))
        }
    }
}

/// Build the pod manifest for a job.
fn pod_manifest(spec: &JobSpec) -> serde_json::Value {
    let labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(key, value)| (key.clone(), label_value(value)))
        .collect();

    let env: Vec<serde_json::Value> = spec
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut container = json!({
        "name": "main",
        "image": spec.image,
        "env": env,
    });
    if !spec.command.is_empty() {
        container["command"] = json!(spec.command);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "labels": labels,
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [container],
        },
    })
}

/// Coerce a string into a valid label value (63 chars of `[A-Za-z0-9._-]`,
/// alphanumeric at both ends).
fn label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Pull `message` out of a Kubernetes `Status` body, falling back to the raw body.
fn api_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ApiStatus {
        message: Option<String>,
    }
    serde_json::from_str::<ApiStatus>(body)
        .ok()
        .and_then(|s| s.message)
        .unwrap_or_else(|| body.to_string())
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: PodMetadata,
    status: Option<PodStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct PodMetadata {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    phase: Option<String>,
    reason: Option<String>,
    message: Option<String>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    state: Option<ContainerState>,
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    terminated: Option<TerminatedState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminatedState {
    exit_code: i64,
    reason: Option<String>,
}

impl From<PodStatus> for NativeStatus {
    fn from(status: PodStatus) -> Self {
        let terminated = status
            .container_statuses
            .into_iter()
            .filter_map(|s| s.state.and_then(|state| state.terminated))
            .next();

        let message = status
            .message
            .or(status.reason)
            .or_else(|| terminated.as_ref().and_then(|t| t.reason.clone()));

        NativeStatus {
            phase: status.phase.unwrap_or_else(|| "Unknown".to_string()),
            exit_code: terminated.map(|t| t.exit_code),
            message,
        }
    }
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn backend_type(&self) -> &'static str {
        "kubernetes"
    }

    fn vocabulary(&self) -> &'static PhaseVocabulary {
        &KUBERNETES_PHASES
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<JobHandle> {
        let response = self
            .authorized(self.client.post(self.pods_url()).json(&pod_manifest(spec)))
            .send()
            .await
            .map_err(|e| BackendError::NoBackendAvailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejected(format!(
                "{} {}",
                status,
                api_message(&body)
            )));
        }

        let pod: Pod = response
            .json()
            .await
            .map_err(|e| BackendError::Other(format!("invalid pod response: {}", e)))?;
        let name = pod.metadata.name.unwrap_or_else(|| spec.name.clone());

        info!(
            pod = %name,
            namespace = %self.config.namespace,
            image = %spec.image,
            "Kubernetes pod created"
        );

        Ok(JobHandle::new(name))
    }

    async fn get_status(&self, handle: &JobHandle) -> Result<NativeStatus> {
        let response = self
            .send_for_pod(&handle.job_id, self.client.get(self.pod_url(&handle.job_id)))
            .await?;
        let pod: Pod = response
            .json()
            .await
            .map_err(|e| BackendError::Other(format!("invalid pod response: {}", e)))?;

        Ok(pod
            .status
            .map(NativeStatus::from)
            .unwrap_or_else(|| NativeStatus::phase("Unknown")))
    }

    async fn kill(&self, handle: &JobHandle) -> Result<()> {
        let request = self
            .client
            .delete(self.pod_url(&handle.job_id))
            .query(&[("gracePeriodSeconds", "0")]);
        self.send_for_pod(&handle.job_id, request).await?;
        debug!(pod = %handle.job_id, "Pod killed");
        Ok(())
    }

    async fn remove(&self, handle: &JobHandle) -> Result<()> {
        let request = self.client.delete(self.pod_url(&handle.job_id));
        match self.send_for_pod(&handle.job_id, request).await {
            Ok(_) | Err(BackendError::JobNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fetch_logs(&self, handle: &JobHandle) -> Result<LogStream> {
        let url = format!("{}/log", self.pod_url(&handle.job_id));
        let response = self
            .send_for_pod(&handle.job_id, self.client.get(url))
            .await?;

        let stream = response
            .bytes_stream()
            .map_err(|e| BackendError::Unreachable(e.to_string()));
        Ok(Box::pin(stream))
    }
}
