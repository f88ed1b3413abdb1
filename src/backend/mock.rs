//! Scripted backend used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::client::BackendClient;
use super::models::{
    ActivationEvent, CatalogResponse, InstallEvent, InstallRequest, InstallResponse,
    RegisterRequest, RegisterResponse, ReloadResponse, RunningNode, WorkflowEvent,
    WorkflowStopResponse,
};
use super::stream::EventStream;

/// Build a finished stream from a fixed script of events.
pub fn script_stream<T: Send + 'static>(events: Vec<T>) -> EventStream<T> {
    let (tx, stream) = EventStream::channel(events.len() + 1);
    for ev in events {
        tx.try_send(ev).expect("scripted stream overflow");
    }
    stream
}

/// Build a stream that stays open until the returned sender is dropped.
pub fn open_stream<T: Send + 'static>() -> (mpsc::Sender<T>, EventStream<T>) {
    EventStream::channel(16)
}

#[derive(Default)]
pub struct MockBackend {
    pub catalog: Mutex<CatalogResponse>,
    pub running: Mutex<HashMap<String, RunningNode>>,
    pub catalog_fail: AtomicBool,
    pub running_fail: AtomicBool,
    /// When set, a stop_node call clears the running view (the backend
    /// actually tore the process down).
    pub clear_running_on_stop: AtomicBool,
    pub catalog_fetches: AtomicUsize,

    pub register_calls: Mutex<Vec<RegisterRequest>>,
    pub register_code: Mutex<i32>,
    pub stop_calls: Mutex<Vec<String>>,
    pub install_calls: Mutex<Vec<InstallRequest>>,
    pub workflow_starts: Mutex<Vec<serde_json::Value>>,
    pub stop_workflow_calls: Mutex<Vec<String>>,
    pub reload_calls: Mutex<Vec<String>>,
    pub reload_generated: Mutex<Option<super::models::GeneratedArtifact>>,

    pub activation_streams: Mutex<HashMap<String, VecDeque<EventStream<ActivationEvent>>>>,
    pub install_streams: Mutex<VecDeque<EventStream<InstallEvent>>>,
    pub workflow_streams: Mutex<VecDeque<EventStream<WorkflowEvent>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_catalog_node(&self, category: &str, name: &str, entry: serde_json::Value) {
        self.catalog
            .lock()
            .unwrap()
            .entry(category.to_string())
            .or_default()
            .insert(name.to_string(), entry);
    }

    pub fn set_running(&self, name: &str, node: RunningNode) {
        self.running.lock().unwrap().insert(name.to_string(), node);
    }

    pub fn push_activation_events(&self, node: &str, events: Vec<ActivationEvent>) {
        self.activation_streams
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .push_back(script_stream(events));
    }

    pub fn push_activation_stream(&self, node: &str, stream: EventStream<ActivationEvent>) {
        self.activation_streams
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .push_back(stream);
    }

    pub fn push_install_events(&self, events: Vec<InstallEvent>) {
        self.install_streams
            .lock()
            .unwrap()
            .push_back(script_stream(events));
    }

    pub fn push_install_stream(&self, stream: EventStream<InstallEvent>) {
        self.install_streams.lock().unwrap().push_back(stream);
    }

    pub fn push_workflow_events(&self, events: Vec<WorkflowEvent>) {
        self.workflow_streams
            .lock()
            .unwrap()
            .push_back(script_stream(events));
    }

    pub fn push_workflow_stream(&self, stream: EventStream<WorkflowEvent>) {
        self.workflow_streams.lock().unwrap().push_back(stream);
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn fetch_catalog(&self) -> Result<CatalogResponse> {
        self.catalog_fetches.fetch_add(1, Ordering::SeqCst);
        if self.catalog_fail.load(Ordering::SeqCst) {
            bail!("catalog unavailable");
        }
        Ok(self.catalog.lock().unwrap().clone())
    }

    async fn fetch_running(&self) -> Result<HashMap<String, RunningNode>> {
        if self.running_fail.load(Ordering::SeqCst) {
            bail!("running view unavailable");
        }
        Ok(self.running.lock().unwrap().clone())
    }

    async fn register_node(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        self.register_calls.lock().unwrap().push(req.clone());
        Ok(RegisterResponse {
            code: *self.register_code.lock().unwrap(),
            log_path: Some(format!("/logs/{}.log", req.model_name)),
        })
    }

    async fn stop_node(&self, env_name: &str) -> Result<()> {
        self.stop_calls.lock().unwrap().push(env_name.to_string());
        if self.clear_running_on_stop.load(Ordering::SeqCst) {
            self.running.lock().unwrap().clear();
        }
        Ok(())
    }

    async fn start_install(&self, req: &InstallRequest) -> Result<InstallResponse> {
        self.install_calls.lock().unwrap().push(req.clone());
        Ok(InstallResponse {
            install_id: format!("inst-{}", self.install_calls.lock().unwrap().len()),
        })
    }

    async fn start_workflow(&self, payload: &serde_json::Value) -> Result<()> {
        self.workflow_starts.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn stop_workflow(&self, target_path: &str) -> Result<WorkflowStopResponse> {
        self.stop_workflow_calls
            .lock()
            .unwrap()
            .push(target_path.to_string());
        Ok(WorkflowStopResponse {
            stopped_processes: Some(2),
            rollback_performed: Some(false),
            restarted_nodes: vec![],
        })
    }

    async fn reload_dataset(&self, target_path: &str) -> Result<ReloadResponse> {
        self.reload_calls.lock().unwrap().push(target_path.to_string());
        Ok(ReloadResponse {
            generated: self.reload_generated.lock().unwrap().clone(),
        })
    }

    async fn activation_events(&self, node: &str) -> Result<EventStream<ActivationEvent>> {
        let next = self
            .activation_streams
            .lock()
            .unwrap()
            .get_mut(node)
            .and_then(|q| q.pop_front());
        Ok(next.unwrap_or_else(|| script_stream(vec![])))
    }

    async fn install_events(&self, _install_id: &str) -> Result<EventStream<InstallEvent>> {
        let next = self.install_streams.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| script_stream(vec![])))
    }

    async fn workflow_events(&self, _target_path: &str) -> Result<EventStream<WorkflowEvent>> {
        let next = self.workflow_streams.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| script_stream(vec![])))
    }
}
