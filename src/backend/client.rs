use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;

use super::models::{
    ActivationEvent, CatalogResponse, InstallEvent, InstallRequest, InstallResponse,
    RegisterRequest, RegisterResponse, ReloadResponse, RunningNode, WorkflowEvent,
    WorkflowStopResponse,
};
use super::stream::{EventStream, open_json_stream};

/// Everything the orchestration client needs from the backend AI service.
/// Behind a trait so tests can script responses and event streams.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn fetch_catalog(&self) -> Result<CatalogResponse>;
    async fn fetch_running(&self) -> Result<HashMap<String, RunningNode>>;
    async fn register_node(&self, req: &RegisterRequest) -> Result<RegisterResponse>;
    async fn stop_node(&self, env_name: &str) -> Result<()>;
    async fn start_install(&self, req: &InstallRequest) -> Result<InstallResponse>;
    async fn start_workflow(&self, payload: &serde_json::Value) -> Result<()>;
    async fn stop_workflow(&self, target_path: &str) -> Result<WorkflowStopResponse>;
    async fn reload_dataset(&self, target_path: &str) -> Result<ReloadResponse>;

    async fn activation_events(&self, node: &str) -> Result<EventStream<ActivationEvent>>;
    async fn install_events(&self, install_id: &str) -> Result<EventStream<InstallEvent>>;
    async fn workflow_events(&self, target_path: &str) -> Result<EventStream<WorkflowEvent>>;
}

pub struct HttpBackendClient {
    client: Client,
    base_url: String,
    request_timeout: std::time::Duration,
}

impl HttpBackendClient {
    /// The reqwest client must not carry an overall request timeout: event
    /// streams stay open for minutes. Plain calls get `request_timeout`
    /// applied per request instead.
    pub fn new(client: Client, base_url: String, request_timeout: std::time::Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json<B: serde::Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        what: &str,
    ) -> Result<T> {
        let resp = self
            .client
            .post(self.url(path))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to {what}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("backend error {status} on {what}: {body}");
        }

        resp.json()
            .await
            .with_context(|| format!("failed to parse {what} response"))
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn fetch_catalog(&self) -> Result<CatalogResponse> {
        let resp = self
            .client
            .get(self.url("/api/catalog"))
            .timeout(self.request_timeout)
            .send()
            .await
            .context("failed to fetch catalog")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("backend error {status} fetching catalog: {body}");
        }

        resp.json().await.context("failed to parse catalog")
    }

    async fn fetch_running(&self) -> Result<HashMap<String, RunningNode>> {
        let resp = self
            .client
            .get(self.url("/api/nodes/running"))
            .timeout(self.request_timeout)
            .send()
            .await
            .context("failed to fetch running nodes")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("backend error {status} fetching running nodes: {body}");
        }

        resp.json().await.context("failed to parse running nodes")
    }

    async fn register_node(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        self.post_json("/api/nodes/register", req, "register node")
            .await
    }

    async fn stop_node(&self, env_name: &str) -> Result<()> {
        let payload = serde_json::json!({ "env_name": env_name });
        let _: serde_json::Value = self.post_json("/api/nodes/stop", &payload, "stop node").await?;
        Ok(())
    }

    async fn start_install(&self, req: &InstallRequest) -> Result<InstallResponse> {
        self.post_json("/api/installs", req, "start install").await
    }

    async fn start_workflow(&self, payload: &serde_json::Value) -> Result<()> {
        let _: serde_json::Value = self
            .post_json("/api/workflows/start", payload, "start workflow")
            .await?;
        Ok(())
    }

    async fn stop_workflow(&self, target_path: &str) -> Result<WorkflowStopResponse> {
        let payload = serde_json::json!({ "target_path": target_path });
        self.post_json("/api/workflows/stop", &payload, "stop workflow")
            .await
    }

    async fn reload_dataset(&self, target_path: &str) -> Result<ReloadResponse> {
        let payload = serde_json::json!({ "target_path": target_path });
        self.post_json("/api/datasets/reload", &payload, "reload dataset")
            .await
    }

    async fn activation_events(&self, node: &str) -> Result<EventStream<ActivationEvent>> {
        open_json_stream(&self.client, self.url(&format!("/api/nodes/{node}/events"))).await
    }

    async fn install_events(&self, install_id: &str) -> Result<EventStream<InstallEvent>> {
        open_json_stream(
            &self.client,
            self.url(&format!("/api/installs/{install_id}/events")),
        )
        .await
    }

    async fn workflow_events(&self, target_path: &str) -> Result<EventStream<WorkflowEvent>> {
        // Target paths are dataset handles with slashes; pass as a query
        // parameter rather than a path segment.
        let url = reqwest::Url::parse_with_params(
            &self.url("/api/workflows/events"),
            &[("target_path", target_path)],
        )
        .context("invalid workflow events url")?;
        open_json_stream(&self.client, url.to_string()).await
    }
}
