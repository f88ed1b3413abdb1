use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::activation::ActivationState;
use crate::backend::models::{InstallStep, StepStatus};
use crate::workflow::engine::NodeRunStatus;

/// Notification fanned out to the rest of the application: status bars,
/// slide viewers and panel editors subscribe to a broadcast receiver.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub timestamp: DateTime<Utc>,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn now(kind: NotificationKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationKind {
    NodeStatusChanged {
        node: String,
        status: ActivationState,
    },
    InstallProgress {
        install_id: String,
        step: InstallStep,
        status: StepStatus,
        download_percent: Option<u8>,
    },
    InstallFinished {
        install_id: String,
        success: bool,
        failed_step: Option<InstallStep>,
    },
    WorkflowProgress {
        target_path: String,
        node: String,
        status: NodeRunStatus,
        progress: Option<u8>,
    },
    /// The dataset behind `target_path` changed; dependent viewers should
    /// re-read it.
    DataChanged {
        target_path: String,
    },
    /// A run produced an artifact for the panel bound to `node_type`;
    /// emitted at most once per run.
    PanelArtifact {
        panel_id: String,
        node_type: String,
        content: serde_json::Value,
    },
    WorkflowFinished {
        target_path: String,
    },
}

pub type NotificationSender = broadcast::Sender<Notification>;

pub fn channel() -> (NotificationSender, broadcast::Receiver<Notification>) {
    broadcast::channel(256)
}

/// Send ignoring the no-subscribers case.
pub(crate) fn emit(bus: &NotificationSender, kind: NotificationKind) {
    let _ = bus.send(Notification::now(kind));
}
