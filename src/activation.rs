use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::backend::models::{ActivationEvent, ActivationPhase, RegisterRequest, RuntimeDescriptor};
use crate::backend::{BackendClient, EventStream};
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::events::{NotificationKind, NotificationSender, emit};
use crate::registry::NodeRegistry;
use crate::subscription::SubscriptionSet;

/// Where the failure left its traces; kept until the user retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureMeta {
    pub log_path: Option<String>,
    pub env_name: Option<String>,
    pub port: Option<u16>,
    pub message: Option<String>,
}

/// Lifecycle state of one task node. `Activating` is client-side and
/// optimistic; it only ends through a terminal stream event or a registry
/// reconciliation. `Running` mirrors the backend's report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    Unregistered,
    Inactive,
    Activating,
    Running,
    Failed(FailureMeta),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivateOutcome {
    Stopped,
    /// The registry still reported the node running when the poll budget
    /// ran out; state reflects the registry, not an assumed stop.
    StillReported,
}

/// Per-node activation lifecycle controller. Owns the status map; every
/// transition happens in here.
pub struct ActivationManager {
    client: Arc<dyn BackendClient>,
    registry: Arc<NodeRegistry>,
    subs: Arc<SubscriptionSet>,
    bus: NotificationSender,
    statuses: Arc<RwLock<HashMap<String, ActivationState>>>,
    stop_poll_attempts: u32,
    stop_poll_interval: Duration,
}

impl ActivationManager {
    pub fn new(
        client: Arc<dyn BackendClient>,
        registry: Arc<NodeRegistry>,
        subs: Arc<SubscriptionSet>,
        bus: NotificationSender,
        config: &Config,
    ) -> Self {
        Self {
            client,
            registry,
            subs,
            bus,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            stop_poll_attempts: config.stop_poll_attempts,
            stop_poll_interval: config.stop_poll_interval,
        }
    }

    pub async fn status(&self, node: &str) -> ActivationState {
        if let Some(state) = self.statuses.read().await.get(node) {
            return state.clone();
        }
        if self.registry.is_running(node).await {
            ActivationState::Running
        } else if self.registry.contains(node).await {
            ActivationState::Inactive
        } else {
            ActivationState::Unregistered
        }
    }

    /// Register the node with the backend and track its startup stream.
    /// A second call while the node is `Activating` is a no-op; exactly one
    /// registration request is in flight per node.
    pub async fn activate(
        &self,
        node: &str,
        descriptor: &RuntimeDescriptor,
        install_dependencies: bool,
    ) -> Result<(), OrchestratorError> {
        if descriptor.service_path.trim().is_empty() {
            return Err(OrchestratorError::InvalidDescriptor("service_path is empty"));
        }
        if descriptor.is_script()
            && descriptor.env_name.is_none()
            && descriptor.dependency_path.is_none()
        {
            return Err(OrchestratorError::InvalidDescriptor(
                "script entry points need env_name or dependency_path",
            ));
        }

        if matches!(
            self.statuses.read().await.get(node),
            Some(ActivationState::Activating)
        ) {
            tracing::debug!(node = %node, "activation already in flight");
            return Ok(());
        }

        let req = RegisterRequest {
            model_name: node.to_string(),
            service_path: descriptor.service_path.clone(),
            env_name: descriptor.env_name.clone(),
            port: descriptor.port,
            dependency_path: descriptor.dependency_path.clone(),
            install_dependencies,
        };
        let resp = self
            .client
            .register_node(&req)
            .await
            .map_err(OrchestratorError::Backend)?;
        if resp.code != 0 {
            return Err(OrchestratorError::RegistrationRejected {
                code: resp.code,
                log_path: resp.log_path,
            });
        }

        tracing::info!(node = %node, log_path = ?resp.log_path, "registration accepted");
        set_status(&self.statuses, &self.bus, node, ActivationState::Activating).await;

        let stream = self
            .client
            .activation_events(node)
            .await
            .map_err(OrchestratorError::Backend)?;
        let pump = activation_pump(
            node.to_string(),
            stream,
            self.statuses.clone(),
            self.registry.clone(),
            self.subs.clone(),
            self.bus.clone(),
        );
        self.subs.subscribe(&activation_key(node), pump).await;
        Ok(())
    }

    /// Stop a running node and poll the registry until it disappears from
    /// the running view or the poll budget runs out.
    pub async fn deactivate(&self, node: &str) -> Result<DeactivateOutcome, OrchestratorError> {
        if !matches!(self.status(node).await, ActivationState::Running) {
            return Err(OrchestratorError::NotRunning(node.to_string()));
        }

        let mut env_name = self
            .registry
            .running_entry(node)
            .await
            .and_then(|r| r.env_name);
        if env_name.is_none() {
            env_name = self
                .registry
                .runtime_descriptor(node)
                .await
                .and_then(|d| d.env_name);
        }
        let env_name = env_name.unwrap_or_else(|| fallback_env_name(node));

        self.client
            .stop_node(&env_name)
            .await
            .map_err(OrchestratorError::Backend)?;

        for attempt in 1..=self.stop_poll_attempts {
            self.registry.refresh().await;
            if !self.registry.is_running(node).await {
                tracing::info!(node = %node, attempt, "node stopped");
                set_status(&self.statuses, &self.bus, node, ActivationState::Inactive).await;
                return Ok(DeactivateOutcome::Stopped);
            }
            tokio::time::sleep(self.stop_poll_interval).await;
        }

        // Soft failure: reflect whatever the registry last reported.
        tracing::warn!(node = %node, "still reported running after stop timeout");
        let state = if self.registry.is_running(node).await {
            ActivationState::Running
        } else {
            ActivationState::Inactive
        };
        set_status(&self.statuses, &self.bus, node, state).await;
        Ok(DeactivateOutcome::StillReported)
    }

    /// Refresh the registry and realign the status map with its report.
    /// Corrects nodes left `Activating` by a torn-down stream.
    pub async fn refresh_registry(&self) {
        self.registry.refresh().await;
        self.reconcile().await;
    }

    async fn reconcile(&self) {
        for node in self.registry.nodes().await {
            let live = self.subs.contains(&activation_key(&node.name)).await;
            let running = self.registry.is_running(&node.name).await;
            let current = self.statuses.read().await.get(&node.name).cloned();
            let next = if running {
                ActivationState::Running
            } else {
                match current {
                    Some(ActivationState::Activating) if live => ActivationState::Activating,
                    Some(ActivationState::Failed(meta)) => ActivationState::Failed(meta),
                    _ => ActivationState::Inactive,
                }
            };
            set_status(&self.statuses, &self.bus, &node.name, next).await;
        }
    }
}

pub(crate) fn activation_key(node: &str) -> String {
    format!("activation:{node}")
}

/// Backend-visible environment id when neither the running view nor the
/// cached descriptor carries one.
fn fallback_env_name(node: &str) -> String {
    node.to_lowercase().split_whitespace().collect::<Vec<_>>().join("-")
}

async fn set_status(
    statuses: &Arc<RwLock<HashMap<String, ActivationState>>>,
    bus: &NotificationSender,
    node: &str,
    next: ActivationState,
) {
    let changed = {
        let mut map = statuses.write().await;
        if map.get(node) == Some(&next) {
            false
        } else {
            map.insert(node.to_string(), next.clone());
            true
        }
    };
    if changed {
        emit(
            bus,
            NotificationKind::NodeStatusChanged {
                node: node.to_string(),
                status: next,
            },
        );
    }
}

async fn activation_pump(
    node: String,
    mut stream: EventStream<ActivationEvent>,
    statuses: Arc<RwLock<HashMap<String, ActivationState>>>,
    registry: Arc<NodeRegistry>,
    subs: Arc<SubscriptionSet>,
    bus: NotificationSender,
) {
    let mut ready = false;
    while let Some(ev) = stream.next().await {
        match ev.status {
            // Repeatable; the node is still warming up.
            ActivationPhase::Starting => {
                tracing::debug!(node = %node, "node starting");
            }
            ActivationPhase::Ready => {
                set_status(&statuses, &bus, &node, ActivationState::Running).await;
                ready = true;
                break;
            }
            ActivationPhase::Failed => {
                let meta = FailureMeta {
                    log_path: ev.data.log_path,
                    env_name: ev.data.env_name,
                    port: ev.data.port,
                    message: ev.data.message,
                };
                tracing::warn!(node = %node, log_path = ?meta.log_path, "activation failed");
                set_status(&statuses, &bus, &node, ActivationState::Failed(meta)).await;
                break;
            }
        }
    }
    // Terminal event or silent stream loss either way: this pump is done.
    subs.release(&activation_key(&node)).await;
    if ready {
        registry.refresh().await;
    }
}
