use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::activation::ActivationManager;
use crate::backend::models::{InstallEvent, InstallRequest, InstallStep, StepStatus};
use crate::backend::{BackendClient, EventStream};
use crate::error::OrchestratorError;
use crate::events::{NotificationKind, NotificationSender, emit};
use crate::subscription::SubscriptionSet;

#[derive(Debug, Clone, Serialize)]
pub struct StepState {
    pub step: InstallStep,
    pub status: StepStatus,
}

/// Ledger of one installation attempt. Step advancement is monotonic: an
/// incoming event marks everything before its step done (unless failed) and
/// never downgrades a step, so at most one step is active at a time.
#[derive(Debug, Clone, Serialize)]
pub struct InstallJob {
    pub install_id: String,
    pub model_name: String,
    pub steps: Vec<StepState>,
    pub received_bytes: u64,
    pub total_bytes: Option<u64>,
    pub error: Option<String>,
}

impl InstallJob {
    fn new(install_id: String, model_name: String) -> Self {
        Self {
            install_id,
            model_name,
            steps: InstallStep::ALL
                .iter()
                .map(|step| StepState {
                    step: *step,
                    status: StepStatus::Pending,
                })
                .collect(),
            received_bytes: 0,
            total_bytes: None,
            error: None,
        }
    }

    fn apply(&mut self, ev: &InstallEvent) {
        let idx = ev.step.ordinal();
        for earlier in &mut self.steps[..idx] {
            if earlier.status != StepStatus::Failed {
                earlier.status = StepStatus::Done;
            }
        }
        let current = &mut self.steps[idx];
        if ev.status.rank() > current.status.rank() {
            current.status = ev.status;
        }

        if ev.step == InstallStep::Download {
            if let Some(received) = ev.received_bytes {
                self.received_bytes = self.received_bytes.max(received);
            }
            if ev.total_bytes.is_some() {
                self.total_bytes = ev.total_bytes;
            }
        }
        if ev.status == StepStatus::Failed {
            self.error = ev.message.clone();
        }
    }

    pub fn download_percent(&self) -> Option<u8> {
        let total = self.total_bytes.filter(|t| *t > 0)?;
        Some(((self.received_bytes.min(total) * 100) / total) as u8)
    }

    pub fn failed_step(&self) -> Option<InstallStep> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| s.step)
    }

    pub fn succeeded(&self) -> bool {
        self.steps
            .last()
            .map(|s| s.step == InstallStep::Ready && s.status == StepStatus::Done)
            .unwrap_or(false)
    }

    pub fn is_terminal(&self) -> bool {
        self.failed_step().is_some() || self.succeeded()
    }
}

/// Single-flight bundle installer. One install at a time system-wide; a
/// concurrent request is rejected, never queued.
pub struct InstallPipeline {
    client: Arc<dyn BackendClient>,
    subs: Arc<SubscriptionSet>,
    activation: Arc<ActivationManager>,
    bus: NotificationSender,
    job: Arc<RwLock<Option<InstallJob>>>,
}

impl InstallPipeline {
    pub fn new(
        client: Arc<dyn BackendClient>,
        subs: Arc<SubscriptionSet>,
        activation: Arc<ActivationManager>,
        bus: NotificationSender,
    ) -> Self {
        Self {
            client,
            subs,
            activation,
            bus,
            job: Arc::new(RwLock::new(None)),
        }
    }

    /// Start installing a bundle. Fails with `InstallBusy` while another
    /// install is in flight.
    pub async fn install(&self, bundle: InstallRequest) -> Result<String, OrchestratorError> {
        // The slot lock is held across the start request; it is the only
        // mutual-exclusion primitive the installer has.
        let mut slot = self.job.write().await;
        if slot.as_ref().map(|job| !job.is_terminal()).unwrap_or(false) {
            return Err(OrchestratorError::InstallBusy);
        }

        let resp = self
            .client
            .start_install(&bundle)
            .await
            .map_err(OrchestratorError::Backend)?;
        let install_id = resp.install_id;
        tracing::info!(install_id = %install_id, model = %bundle.model_name, "install accepted");
        *slot = Some(InstallJob::new(install_id.clone(), bundle.model_name));
        drop(slot);

        let stream = self
            .client
            .install_events(&install_id)
            .await
            .map_err(OrchestratorError::Backend)?;
        let pump = install_pump(
            install_id.clone(),
            stream,
            self.job.clone(),
            self.activation.clone(),
            self.subs.clone(),
            self.bus.clone(),
        );
        self.subs.subscribe(&install_key(&install_id), pump).await;
        Ok(install_id)
    }

    /// Current ledger, terminal ones included, until dismissed.
    pub async fn snapshot(&self) -> Option<InstallJob> {
        self.job.read().await.clone()
    }

    /// Dialog-close path: drop the ledger and tear down the stream if one
    /// is still open.
    pub async fn dismiss(&self) {
        let discarded = self.job.write().await.take();
        if let Some(job) = discarded {
            self.subs.unsubscribe(&install_key(&job.install_id)).await;
        }
    }
}

fn install_key(install_id: &str) -> String {
    format!("install:{install_id}")
}

async fn install_pump(
    install_id: String,
    mut stream: EventStream<InstallEvent>,
    job: Arc<RwLock<Option<InstallJob>>>,
    activation: Arc<ActivationManager>,
    subs: Arc<SubscriptionSet>,
    bus: NotificationSender,
) {
    let mut outcome = None;
    while let Some(ev) = stream.next().await {
        let progress = {
            let mut slot = job.write().await;
            match slot.as_mut() {
                Some(current) if current.install_id == install_id => {
                    current.apply(&ev);
                    Some((current.download_percent(), current.is_terminal(), current.succeeded()))
                }
                // Dismissed or replaced; stop pumping.
                _ => None,
            }
        };
        let Some((percent, terminal, succeeded)) = progress else {
            break;
        };
        emit(
            &bus,
            NotificationKind::InstallProgress {
                install_id: install_id.clone(),
                step: ev.step,
                status: ev.status,
                download_percent: percent,
            },
        );
        if terminal {
            outcome = Some(succeeded);
            break;
        }
    }

    subs.release(&install_key(&install_id)).await;

    match outcome {
        Some(true) => {
            tracing::info!(install_id = %install_id, "install finished");
            // The bundle is expected to end with its node running; refresh
            // and realign statuses so the node list shows it immediately.
            activation.refresh_registry().await;
            emit(
                &bus,
                NotificationKind::InstallFinished {
                    install_id,
                    success: true,
                    failed_step: None,
                },
            );
        }
        Some(false) => {
            let failed_step = job.read().await.as_ref().and_then(|j| j.failed_step());
            tracing::warn!(install_id = %install_id, step = ?failed_step, "install failed");
            emit(
                &bus,
                NotificationKind::InstallFinished {
                    install_id,
                    success: false,
                    failed_step,
                },
            );
        }
        // Stream lost or job dismissed: no retry, the user re-triggers.
        None => tracing::debug!(install_id = %install_id, "install stream closed"),
    }
}
