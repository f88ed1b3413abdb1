use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Catalog & running view ───────────────────────────────────────

/// The `runtime` block the backend attaches to a catalog entry once a node
/// has been registered at least once. Cached client-side so a node can be
/// reactivated with one click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub service_path: String,
    #[serde(default)]
    pub env_name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub dependency_path: Option<String>,
}

impl RuntimeDescriptor {
    /// Interpreted entry points need an environment or a dependency path
    /// before the backend can launch them.
    pub fn is_script(&self) -> bool {
        self.service_path.ends_with(".py")
    }
}

/// One node's metadata as it appears in the catalog, under its category.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub runtime: Option<RuntimeDescriptor>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub activating: bool,
    #[serde(default)]
    pub log_path: Option<String>,
}

/// Catalog payload: category → node name → raw entry. Entries are parsed
/// per key so one malformed node cannot invalidate the rest.
pub type CatalogResponse = HashMap<String, HashMap<String, serde_json::Value>>;

/// One row of the running-nodes view.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunningNode {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub env_name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub log_path: Option<String>,
}

// ── Registration & activation events ─────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub model_name: String,
    pub service_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_path: Option<String>,
    pub install_dependencies: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub code: i32,
    #[serde(default)]
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPhase {
    Starting,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivationEventData {
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub env_name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One event on a node's activation stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationEvent {
    pub status: ActivationPhase,
    #[serde(default)]
    pub data: ActivationEventData,
}

// ── Bundle installation ──────────────────────────────────────────

/// Install steps in pipeline order. The ordering of the variants is the
/// ordering of the pipeline; `ordinal` indexes into a job's step ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    Sign,
    Download,
    Verify,
    Unpack,
    Persist,
    Activate,
    Ready,
}

impl InstallStep {
    pub const ALL: [InstallStep; 7] = [
        InstallStep::Sign,
        InstallStep::Download,
        InstallStep::Verify,
        InstallStep::Unpack,
        InstallStep::Persist,
        InstallStep::Activate,
        InstallStep::Ready,
    ];

    pub fn ordinal(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Done,
    Failed,
}

impl StepStatus {
    /// Rank used to enforce monotonic advancement within one step.
    pub fn rank(self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::Active => 1,
            StepStatus::Done => 2,
            StepStatus::Failed => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallRequest {
    pub model_name: String,
    pub source_uri: String,
    pub filename: String,
    pub entry_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallResponse {
    pub install_id: String,
}

/// One event on an install stream.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallEvent {
    pub step: InstallStep,
    pub status: StepStatus,
    #[serde(default)]
    pub received_bytes: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

// ── Workflow execution ───────────────────────────────────────────

/// One event on the workflow status stream. Node statuses are the raw wire
/// integers (-1 failed, 0 not started, 1 running, 2 complete).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowEvent {
    #[serde(default)]
    pub node_status: HashMap<String, i64>,
    #[serde(default)]
    pub node_progress: HashMap<String, u8>,
    #[serde(default)]
    pub workflow_complete: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowStopResponse {
    #[serde(default)]
    pub stopped_processes: Option<u32>,
    #[serde(default)]
    pub rollback_performed: Option<bool>,
    #[serde(default)]
    pub restarted_nodes: Vec<String>,
}

/// Artifact a node generated during the run, returned by the reload call.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedArtifact {
    pub node_type: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReloadResponse {
    #[serde(default)]
    pub generated: Option<GeneratedArtifact>,
}
