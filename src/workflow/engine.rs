use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::models::WorkflowEvent;
use crate::backend::{BackendClient, EventStream};
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::events::{NotificationKind, NotificationSender, emit};
use crate::registry::NodeRegistry;
use crate::subscription::SubscriptionSet;
use crate::workflow::{WorkflowPanel, build_payload};

/// Per-node state within a run, decoded from the wire integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    NotStarted,
    Running,
    Complete,
    Failed,
}

impl NodeRunStatus {
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            -1 => Some(NodeRunStatus::Failed),
            0 => Some(NodeRunStatus::NotStarted),
            1 => Some(NodeRunStatus::Running),
            2 => Some(NodeRunStatus::Complete),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeRunStatus::Complete | NodeRunStatus::Failed)
    }
}

/// Read model for the status bar.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub run_id: String,
    pub target_path: String,
    pub is_running: bool,
    pub complete: bool,
    pub node_status: HashMap<String, NodeRunStatus>,
    pub node_progress: HashMap<String, u8>,
}

/// What the backend reports it halted for a stop request. Surfaced to the
/// user as-is; the engine does not re-derive completion from it.
#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub stopped_processes: u32,
    pub rollback_performed: bool,
    pub restarted_nodes: Vec<String>,
}

struct RunState {
    run_id: String,
    target_path: String,
    panels: Vec<WorkflowPanel>,
    is_running: bool,
    node_status: HashMap<String, NodeRunStatus>,
    node_progress: HashMap<String, u8>,
    /// One-shot latch around the completion side effects; whichever
    /// completion signal fires first wins, the other becomes a no-op.
    completion_latched: bool,
    /// Set when a resume already refreshed the registry for this run.
    registry_refreshed: bool,
}

impl RunState {
    fn new(run_id: String, target_path: &str, panels: Vec<WorkflowPanel>) -> Self {
        Self {
            run_id,
            target_path: target_path.to_string(),
            panels,
            is_running: true,
            node_status: HashMap::new(),
            node_progress: HashMap::new(),
            completion_latched: false,
            registry_refreshed: false,
        }
    }
}

/// Compiles a panel list into one workflow execution and tracks it to
/// completion over a single status stream.
pub struct WorkflowEngine {
    client: Arc<dyn BackendClient>,
    registry: Arc<NodeRegistry>,
    subs: Arc<SubscriptionSet>,
    bus: NotificationSender,
    state: Arc<RwLock<Option<RunState>>>,
    reconnect_backoff: Duration,
}

impl WorkflowEngine {
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
            state: Arc::new(RwLock::new(None)),
            reconnect_backoff: config.workflow_reconnect_backoff,
        }
    }

    /// Serialize the panels in user order and submit the run. On acceptance
    /// the previous run's tracking is torn down and a single status
    /// subscription is opened for the whole run.
    pub async fn run(
        &self,
        panels: Vec<WorkflowPanel>,
        target_path: &str,
    ) -> Result<String, OrchestratorError> {
        if panels.is_empty() {
            return Err(OrchestratorError::EmptyWorkflow);
        }
        for panel in &panels {
            if !self.registry.contains(&panel.node_type).await {
                return Err(OrchestratorError::UnknownNode(panel.node_type.clone()));
            }
        }

        let payload = build_payload(&panels, target_path);
        self.client
            .start_workflow(&payload)
            .await
            .map_err(OrchestratorError::Backend)?;

        let run_id = Uuid::new_v4().to_string();
        tracing::info!(
            run_id = %run_id,
            target = %target_path,
            steps = panels.len(),
            "workflow submitted"
        );

        let previous_target = self
            .state
            .read()
            .await
            .as_ref()
            .map(|run| run.target_path.clone());
        if let Some(previous) = previous_target {
            self.subs.unsubscribe(&workflow_key(&previous)).await;
        }
        self.subs.unsubscribe(&workflow_key(target_path)).await;

        *self.state.write().await = Some(RunState::new(run_id.clone(), target_path, panels));
        self.open_tracking(target_path).await;
        Ok(run_id)
    }

    /// Ask the backend to halt the run and surface what it stopped.
    pub async fn stop(&self, target_path: &str) -> Result<StopSummary, OrchestratorError> {
        let resp = self
            .client
            .stop_workflow(target_path)
            .await
            .map_err(OrchestratorError::Backend)?;

        self.subs.unsubscribe(&workflow_key(target_path)).await;
        let mut guard = self.state.write().await;
        if let Some(run) = guard.as_mut() {
            if run.target_path == target_path {
                run.is_running = false;
            }
        }
        drop(guard);

        let summary = StopSummary {
            stopped_processes: resp.stopped_processes.unwrap_or(0),
            rollback_performed: resp.rollback_performed.unwrap_or(false),
            restarted_nodes: resp.restarted_nodes,
        };
        tracing::info!(
            target = %target_path,
            stopped = summary.stopped_processes,
            "workflow stopped"
        );
        Ok(summary)
    }

    /// Re-attach to a run that is marked in flight but has no live
    /// subscription (the UI was remounted). Does not re-submit the run;
    /// refreshes the registry at most once per run.
    pub async fn resume(&self) {
        let target = self
            .state
            .read()
            .await
            .as_ref()
            .filter(|run| run.is_running)
            .map(|run| run.target_path.clone());
        let Some(target) = target else {
            return;
        };
        if self.subs.contains(&workflow_key(&target)).await {
            return;
        }

        let refresh = {
            let mut guard = self.state.write().await;
            match guard.as_mut() {
                Some(run) if !run.registry_refreshed => {
                    run.registry_refreshed = true;
                    true
                }
                _ => false,
            }
        };
        if refresh {
            self.registry.refresh().await;
        }

        tracing::info!(target = %target, "re-attaching to in-flight workflow");
        self.open_tracking(&target).await;
    }

    pub async fn progress(&self) -> Option<RunProgress> {
        self.state.read().await.as_ref().map(|run| RunProgress {
            run_id: run.run_id.clone(),
            target_path: run.target_path.clone(),
            is_running: run.is_running,
            complete: run.completion_latched,
            node_status: run.node_status.clone(),
            node_progress: run.node_progress.clone(),
        })
    }

    async fn open_tracking(&self, target: &str) {
        let pump = tracking_pump(
            target.to_string(),
            self.client.clone(),
            self.state.clone(),
            self.subs.clone(),
            self.bus.clone(),
            self.reconnect_backoff,
        );
        self.subs.subscribe(&workflow_key(target), pump).await;
    }
}

pub(crate) fn workflow_key(target_path: &str) -> String {
    format!("workflow:{target_path}")
}

async fn tracking_pump(
    target: String,
    client: Arc<dyn BackendClient>,
    state: Arc<RwLock<Option<RunState>>>,
    subs: Arc<SubscriptionSet>,
    bus: NotificationSender,
    backoff: Duration,
) {
    let mut reconnected = false;
    'outer: loop {
        let mut stream: EventStream<WorkflowEvent> = match client.workflow_events(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "workflow stream failed to open");
                if !reconnect_once(&mut reconnected, &state, &target, backoff).await {
                    break;
                }
                continue;
            }
        };

        while let Some(ev) = stream.next().await {
            if apply_event(&target, ev, &client, &state, &bus).await {
                break 'outer;
            }
        }

        // Stream ended. After detected completion that is expected; during
        // an active run it gets one reconnection attempt.
        if run_finished(&state, &target).await {
            break;
        }
        if !reconnect_once(&mut reconnected, &state, &target, backoff).await {
            tracing::error!(target = %target, "workflow stream lost, giving up");
            break;
        }
    }
    subs.release(&workflow_key(&target)).await;
}

async fn run_finished(state: &Arc<RwLock<Option<RunState>>>, target: &str) -> bool {
    let guard = state.read().await;
    match guard.as_ref() {
        Some(run) if run.target_path == target => !run.is_running || run.completion_latched,
        // The run was replaced or torn down; nothing left to track.
        _ => true,
    }
}

async fn reconnect_once(
    reconnected: &mut bool,
    state: &Arc<RwLock<Option<RunState>>>,
    target: &str,
    backoff: Duration,
) -> bool {
    if *reconnected {
        return false;
    }
    *reconnected = true;
    tracing::warn!(target = %target, backoff = ?backoff, "workflow stream dropped, reconnecting");
    tokio::time::sleep(backoff).await;
    !run_finished(state, target).await
}

/// Fold one status event into the run. Returns true once the run is over
/// (completion fired here, or the run was torn down underneath the pump).
async fn apply_event(
    target: &str,
    ev: WorkflowEvent,
    client: &Arc<dyn BackendClient>,
    state: &Arc<RwLock<Option<RunState>>>,
    bus: &NotificationSender,
) -> bool {
    let fired;
    let panels;
    let mut changes = Vec::new();
    {
        let mut guard = state.write().await;
        let Some(run) = guard.as_mut().filter(|run| run.target_path == target) else {
            return true;
        };
        if !run.is_running {
            return true;
        }

        for (node, raw) in &ev.node_status {
            match NodeRunStatus::from_wire(*raw) {
                Some(status) => {
                    let previous = run.node_status.insert(node.clone(), status);
                    if previous != Some(status) {
                        changes.push((
                            node.clone(),
                            status,
                            ev.node_progress.get(node).copied(),
                        ));
                    }
                }
                None => {
                    tracing::debug!(node = %node, value = raw, "unknown node status value")
                }
            }
        }
        for (node, progress) in &ev.node_progress {
            run.node_progress.insert(node.clone(), (*progress).min(100));
        }

        // Two independent completion signals, either authoritative: the
        // explicit flag, or every panel's node having reached a terminal
        // status. They are not assumed to agree.
        let explicit = ev.workflow_complete.unwrap_or(false);
        let derived = !run.panels.is_empty()
            && run.panels.iter().all(|panel| {
                run.node_status
                    .get(&panel.node_type)
                    .map(|status| status.is_terminal())
                    .unwrap_or(false)
            });

        fired = (explicit || derived) && !run.completion_latched;
        if fired {
            run.completion_latched = true;
            run.is_running = false;
        }
        panels = if fired { run.panels.clone() } else { Vec::new() };
    }

    for (node, status, progress) in changes {
        emit(
            bus,
            NotificationKind::WorkflowProgress {
                target_path: target.to_string(),
                node,
                status,
                progress,
            },
        );
    }

    if fired {
        completion_sequence(target, panels, client, state, bus).await;
    }
    fired
}

/// One-time completion side effects: dataset reload, data-changed
/// broadcast, and at most one artifact injection.
async fn completion_sequence(
    target: &str,
    panels: Vec<WorkflowPanel>,
    client: &Arc<dyn BackendClient>,
    state: &Arc<RwLock<Option<RunState>>>,
    bus: &NotificationSender,
) {
    tracing::info!(target = %target, "workflow complete");

    let generated = match client.reload_dataset(target).await {
        Ok(resp) => resp.generated,
        Err(e) => {
            tracing::error!(target = %target, error = %e, "dataset reload failed");
            None
        }
    };

    emit(
        bus,
        NotificationKind::DataChanged {
            target_path: target.to_string(),
        },
    );

    if let Some(artifact) = generated {
        match panels.iter().find(|p| p.node_type == artifact.node_type) {
            Some(panel) => {
                let mut guard = state.write().await;
                if let Some(run) = guard.as_mut().filter(|run| run.target_path == target) {
                    if let Some(stored) = run.panels.iter_mut().find(|p| p.id == panel.id) {
                        stored
                            .content
                            .insert("generated".to_string(), artifact.content.clone());
                    }
                }
                drop(guard);
                emit(
                    bus,
                    NotificationKind::PanelArtifact {
                        panel_id: panel.id.clone(),
                        node_type: artifact.node_type,
                        content: artifact.content,
                    },
                );
            }
            None => {
                tracing::warn!(
                    node_type = %artifact.node_type,
                    "generated artifact has no matching panel"
                );
            }
        }
    }

    emit(
        bus,
        NotificationKind::WorkflowFinished {
            target_path: target.to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, open_stream};
    use crate::backend::models::GeneratedArtifact;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast;

    fn engine(backend: Arc<MockBackend>) -> (WorkflowEngine, NotificationSender) {
        let mut config = Config::from_raw_values(None, None, None, None, None);
        config.workflow_reconnect_backoff = Duration::from_millis(5);
        let registry = Arc::new(NodeRegistry::new(backend.clone(), None));
        let subs = Arc::new(SubscriptionSet::new());
        let (bus, _rx) = crate::events::channel();
        (
            WorkflowEngine::new(backend, registry, subs, bus.clone(), &config),
            bus,
        )
    }

    fn seed_catalog(backend: &MockBackend, names: &[&str]) {
        for name in names {
            backend.set_catalog_node("analysis", name, json!({"description": "t"}));
        }
    }

    fn panel(id: &str, node_type: &str) -> WorkflowPanel {
        WorkflowPanel {
            id: id.to_string(),
            node_type: node_type.to_string(),
            content: serde_json::Map::new(),
        }
    }

    fn status_event(pairs: &[(&str, i64)]) -> WorkflowEvent {
        WorkflowEvent {
            node_status: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            node_progress: HashMap::new(),
            workflow_complete: None,
        }
    }

    async fn wait_complete(engine: &WorkflowEngine) -> RunProgress {
        for _ in 0..200 {
            if let Some(progress) = engine.progress().await {
                if progress.complete {
                    return progress;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("run never completed");
    }

    fn drain(rx: &mut broadcast::Receiver<crate::events::Notification>) -> Vec<NotificationKind> {
        let mut kinds = Vec::new();
        while let Ok(n) = rx.try_recv() {
            kinds.push(n.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_run_rejects_unknown_node() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a"]);
        let (engine, _bus) = engine(backend.clone());
        engine.registry.refresh().await;

        let err = engine
            .run(vec![panel("p1", "a"), panel("p2", "mystery")], "/data/s.h5")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownNode(name) if name == "mystery"));
        // The run was never submitted.
        assert!(backend.workflow_starts.lock().unwrap().is_empty());
        assert!(engine.progress().await.is_none());
    }

    #[tokio::test]
    async fn test_run_rejects_empty_panel_list() {
        let backend = Arc::new(MockBackend::new());
        let (engine, _bus) = engine(backend);
        assert!(matches!(
            engine.run(vec![], "/data/s.h5").await,
            Err(OrchestratorError::EmptyWorkflow)
        ));
    }

    #[tokio::test]
    async fn test_derived_completion_fires_once_after_last_node() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a", "b", "c"]);
        backend.push_workflow_events(vec![
            status_event(&[("a", 2)]),
            status_event(&[("c", 2)]),
            status_event(&[("b", 2)]),
        ]);

        let (engine, bus) = engine(backend.clone());
        engine.registry.refresh().await;
        let mut rx = bus.subscribe();

        engine
            .run(
                vec![panel("p1", "a"), panel("p2", "b"), panel("p3", "c")],
                "/data/s.h5",
            )
            .await
            .unwrap();

        let progress = wait_complete(&engine).await;
        assert!(!progress.is_running);
        assert_eq!(progress.node_status["b"], NodeRunStatus::Complete);

        assert_eq!(backend.reload_calls.lock().unwrap().len(), 1);
        let kinds = drain(&mut rx);
        let data_changed = kinds
            .iter()
            .filter(|k| matches!(k, NotificationKind::DataChanged { .. }))
            .count();
        let finished = kinds
            .iter()
            .filter(|k| matches!(k, NotificationKind::WorkflowFinished { .. }))
            .count();
        assert_eq!(data_changed, 1);
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn test_explicit_flag_completes_even_with_pending_nodes() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a", "b"]);
        backend.push_workflow_events(vec![WorkflowEvent {
            node_status: HashMap::from([("a".to_string(), 2)]),
            node_progress: HashMap::new(),
            workflow_complete: Some(true),
        }]);

        let (engine, _bus) = engine(backend.clone());
        engine.registry.refresh().await;
        engine
            .run(vec![panel("p1", "a"), panel("p2", "b")], "/data/s.h5")
            .await
            .unwrap();

        // The explicit flag wins even though node b never reported.
        wait_complete(&engine).await;
        assert_eq!(backend.reload_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_both_signals_run_side_effects_once() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a"]);
        // One event satisfies both signals at once; a trailing event tries
        // to complete again.
        backend.push_workflow_events(vec![
            WorkflowEvent {
                node_status: HashMap::from([("a".to_string(), 2)]),
                node_progress: HashMap::new(),
                workflow_complete: Some(true),
            },
            WorkflowEvent {
                node_status: HashMap::new(),
                node_progress: HashMap::new(),
                workflow_complete: Some(true),
            },
        ]);

        let (engine, bus) = engine(backend.clone());
        engine.registry.refresh().await;
        let mut rx = bus.subscribe();
        engine.run(vec![panel("p1", "a")], "/data/s.h5").await.unwrap();

        wait_complete(&engine).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.reload_calls.lock().unwrap().len(), 1);
        let finished = drain(&mut rx)
            .into_iter()
            .filter(|k| matches!(k, NotificationKind::WorkflowFinished { .. }))
            .count();
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn test_failed_node_counts_as_terminal_for_derived_completion() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a", "b"]);
        backend.push_workflow_events(vec![
            status_event(&[("a", 2)]),
            status_event(&[("b", -1)]),
        ]);

        let (engine, _bus) = engine(backend.clone());
        engine.registry.refresh().await;
        engine
            .run(vec![panel("p1", "a"), panel("p2", "b")], "/data/s.h5")
            .await
            .unwrap();

        let progress = wait_complete(&engine).await;
        assert_eq!(progress.node_status["b"], NodeRunStatus::Failed);
        assert_eq!(backend.reload_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_artifact_injected_into_matching_panel_once() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a", "scripting"]);
        *backend.reload_generated.lock().unwrap() = Some(GeneratedArtifact {
            node_type: "scripting".into(),
            content: json!("print('measurements')"),
        });
        backend.push_workflow_events(vec![status_event(&[("a", 2), ("scripting", 2)])]);

        let (engine, bus) = engine(backend.clone());
        engine.registry.refresh().await;
        let mut rx = bus.subscribe();
        engine
            .run(vec![panel("p1", "a"), panel("p2", "scripting")], "/data/s.h5")
            .await
            .unwrap();

        wait_complete(&engine).await;
        let artifacts: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|k| match k {
                NotificationKind::PanelArtifact { panel_id, content, .. } => {
                    Some((panel_id, content))
                }
                _ => None,
            })
            .collect();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].0, "p2");
        assert_eq!(artifacts[0].1, json!("print('measurements')"));
    }

    #[tokio::test]
    async fn test_stop_surfaces_summary_and_clears_running() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a"]);
        let (tx, stream) = open_stream();
        backend.push_workflow_stream(stream);

        let (engine, _bus) = engine(backend.clone());
        engine.registry.refresh().await;
        engine.run(vec![panel("p1", "a")], "/data/s.h5").await.unwrap();

        let summary = engine.stop("/data/s.h5").await.unwrap();
        assert_eq!(summary.stopped_processes, 2);
        assert!(!summary.rollback_performed);

        let progress = engine.progress().await.unwrap();
        assert!(!progress.is_running);
        assert!(!progress.complete);
        assert!(!engine.subs.contains(&workflow_key("/data/s.h5")).await);
        drop(tx);
    }

    #[tokio::test]
    async fn test_resume_reattaches_without_resubmitting() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a"]);
        let (tx1, stream1) = open_stream();
        backend.push_workflow_stream(stream1);

        let (engine, _bus) = engine(backend.clone());
        engine.registry.refresh().await;
        let fetches_after_setup = backend.catalog_fetches.load(Ordering::SeqCst);
        engine.run(vec![panel("p1", "a")], "/data/s.h5").await.unwrap();

        // Simulate a reload: the subscription is gone, the run state stays.
        engine.subs.unsubscribe(&workflow_key("/data/s.h5")).await;
        let (tx2, stream2) = open_stream();
        backend.push_workflow_stream(stream2);
        engine.resume().await;

        assert!(engine.subs.contains(&workflow_key("/data/s.h5")).await);
        // Not re-submitted, and the registry refresh happened exactly once.
        assert_eq!(backend.workflow_starts.lock().unwrap().len(), 1);
        assert_eq!(
            backend.catalog_fetches.load(Ordering::SeqCst),
            fetches_after_setup + 1
        );

        // A second resume cycle skips the refresh (deduplication flag).
        engine.subs.unsubscribe(&workflow_key("/data/s.h5")).await;
        let (tx3, stream3) = open_stream();
        backend.push_workflow_stream(stream3);
        engine.resume().await;
        assert_eq!(
            backend.catalog_fetches.load(Ordering::SeqCst),
            fetches_after_setup + 1
        );

        // Resume with a live subscription is a no-op.
        engine.resume().await;
        drop((tx1, tx2, tx3));
    }

    #[tokio::test]
    async fn test_stream_loss_mid_run_reconnects_once() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a"]);
        // First stream dies after a non-terminal event; the reconnected
        // stream carries the run to completion.
        backend.push_workflow_events(vec![status_event(&[("a", 1)])]);
        backend.push_workflow_events(vec![status_event(&[("a", 2)])]);

        let (engine, _bus) = engine(backend.clone());
        engine.registry.refresh().await;
        engine.run(vec![panel("p1", "a")], "/data/s.h5").await.unwrap();

        wait_complete(&engine).await;
        assert_eq!(backend.reload_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_loss_twice_gives_up_without_completion() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a"]);
        backend.push_workflow_events(vec![status_event(&[("a", 1)])]);
        backend.push_workflow_events(vec![]);

        let (engine, _bus) = engine(backend.clone());
        engine.registry.refresh().await;
        engine.run(vec![panel("p1", "a")], "/data/s.h5").await.unwrap();

        for _ in 0..200 {
            if !engine.subs.contains(&workflow_key("/data/s.h5")).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let progress = engine.progress().await.unwrap();
        // Still marked running so a later resume can re-attach; no
        // completion side effects ran.
        assert!(progress.is_running);
        assert!(!progress.complete);
        assert!(backend.reload_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_run_clears_previous_status_maps() {
        let backend = Arc::new(MockBackend::new());
        seed_catalog(&backend, &["a", "b"]);
        backend.push_workflow_events(vec![status_event(&[("a", 2)])]);

        let (engine, _bus) = engine(backend.clone());
        engine.registry.refresh().await;
        engine.run(vec![panel("p1", "a")], "/data/s.h5").await.unwrap();
        wait_complete(&engine).await;

        let (tx, stream) = open_stream();
        backend.push_workflow_stream(stream);
        engine.run(vec![panel("p1", "b")], "/data/s.h5").await.unwrap();

        let progress = engine.progress().await.unwrap();
        assert!(progress.is_running);
        assert!(!progress.complete);
        assert!(progress.node_status.is_empty());
        drop(tx);
    }

    #[test]
    fn test_node_run_status_wire_mapping() {
        assert_eq!(NodeRunStatus::from_wire(-1), Some(NodeRunStatus::Failed));
        assert_eq!(NodeRunStatus::from_wire(0), Some(NodeRunStatus::NotStarted));
        assert_eq!(NodeRunStatus::from_wire(1), Some(NodeRunStatus::Running));
        assert_eq!(NodeRunStatus::from_wire(2), Some(NodeRunStatus::Complete));
        assert_eq!(NodeRunStatus::from_wire(7), None);
        assert!(NodeRunStatus::Failed.is_terminal());
        assert!(!NodeRunStatus::Running.is_terminal());
    }
}
