use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::activation::ActivationManager;
use crate::backend::{BackendClient, HttpBackendClient};
use crate::config::Config;
use crate::events::{Notification, NotificationSender};
use crate::install::InstallPipeline;
use crate::registry::NodeRegistry;
use crate::subscription::SubscriptionSet;
use crate::workflow::engine::WorkflowEngine;

/// Wires the orchestration components to one backend client and one
/// notification bus. The application shell holds exactly one of these.
pub struct Orchestrator {
    pub registry: Arc<NodeRegistry>,
    pub activation: Arc<ActivationManager>,
    pub install: Arc<InstallPipeline>,
    pub workflow: Arc<WorkflowEngine>,
    subs: Arc<SubscriptionSet>,
    bus: NotificationSender,
}

impl Orchestrator {
    pub fn new(config: &Config, client: Arc<dyn BackendClient>) -> Self {
        let (bus, _) = crate::events::channel();
        let subs = Arc::new(SubscriptionSet::new());
        let registry = Arc::new(NodeRegistry::new(
            client.clone(),
            Some(config.descriptor_cache_path()),
        ));
        let activation = Arc::new(ActivationManager::new(
            client.clone(),
            registry.clone(),
            subs.clone(),
            bus.clone(),
            config,
        ));
        let install = Arc::new(InstallPipeline::new(
            client.clone(),
            subs.clone(),
            activation.clone(),
            bus.clone(),
        ));
        let workflow = Arc::new(WorkflowEngine::new(
            client,
            registry.clone(),
            subs.clone(),
            bus.clone(),
            config,
        ));
        Self {
            registry,
            activation,
            install,
            workflow,
            subs,
            bus,
        }
    }

    /// Orchestrator talking to a real backend over HTTP.
    ///
    /// The shared reqwest client carries only a connect timeout; per-request
    /// timeouts are applied inside the backend client so long-lived event
    /// streams are never cut off.
    pub fn connect(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        let client = Arc::new(HttpBackendClient::new(
            http,
            config.backend_url.clone(),
            config.request_timeout,
        ));
        Ok(Self::new(config, client))
    }

    /// Receiver for the notification bus (status bars, viewers, editors).
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    /// Recover after a shell reload: re-attach to any run still in flight.
    pub async fn resume(&self) {
        self.workflow.resume().await;
    }

    /// Process-wide teardown; force-closes every open subscription.
    pub async fn shutdown(&self) {
        self.subs.shutdown().await;
    }
}
