use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::backend::BackendClient;
use crate::backend::models::{CatalogEntry, RunningNode, RuntimeDescriptor};

/// One catalog node merged with its live state, as rendered in the node list.
#[derive(Debug, Clone, Serialize)]
pub struct TaskNode {
    pub name: String,
    pub category: String,
    pub description: String,
    pub icon: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub runtime: Option<RuntimeDescriptor>,
    pub running: bool,
    pub activating: bool,
    pub log_path: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    nodes: HashMap<String, TaskNode>,
    running: HashMap<String, RunningNode>,
    /// Last-known descriptor per node. Sticky: survives a node losing its
    /// runtime block in the catalog, so reactivation stays one click away.
    descriptors: HashMap<String, RuntimeDescriptor>,
}

/// Cached view of the backend's node catalog and running-nodes report.
///
/// The cache is the single owner of node identity; every read goes through
/// snapshot accessors and every write through `refresh`. Fetch errors are
/// logged and degrade to the previous cache, they never propagate.
pub struct NodeRegistry {
    client: Arc<dyn BackendClient>,
    state: RwLock<RegistryState>,
    cache_path: Option<PathBuf>,
}

impl NodeRegistry {
    pub fn new(client: Arc<dyn BackendClient>, cache_path: Option<PathBuf>) -> Self {
        let mut state = RegistryState::default();
        if let Some(path) = &cache_path {
            state.descriptors = load_descriptor_cache(path);
        }
        Self {
            client,
            state: RwLock::new(state),
            cache_path,
        }
    }

    /// Re-fetch catalog and running view, replacing the cached copies
    /// atomically. A malformed entry under one key is skipped with a
    /// warning; a failed fetch keeps the previous copy of that view.
    pub async fn refresh(&self) {
        let catalog = match self.client.fetch_catalog().await {
            Ok(raw) => Some(parse_catalog(raw)),
            Err(e) => {
                tracing::warn!(error = %e, "catalog fetch failed, keeping cached view");
                None
            }
        };

        let running = match self.client.fetch_running().await {
            Ok(view) => Some(view),
            Err(e) => {
                tracing::warn!(error = %e, "running view fetch failed, keeping cached view");
                None
            }
        };

        let mut state = self.state.write().await;
        if let Some(nodes) = catalog {
            for node in nodes.values() {
                if let Some(runtime) = &node.runtime {
                    state.descriptors.insert(node.name.clone(), runtime.clone());
                }
            }
            state.nodes = nodes;
        }
        if let Some(view) = running {
            state.running = view;
        }

        if let Some(path) = &self.cache_path {
            save_descriptor_cache(path, &state.descriptors);
        }
    }

    /// All known nodes, ordered by category then name, with the running
    /// flag reconciled against the running view.
    pub async fn nodes(&self) -> Vec<TaskNode> {
        let state = self.state.read().await;
        let mut nodes: Vec<TaskNode> = state
            .nodes
            .values()
            .map(|n| {
                let mut node = n.clone();
                node.running = is_running_entry(state.running.get(&n.name));
                node
            })
            .collect();
        nodes.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
        nodes
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.read().await.nodes.contains_key(name)
    }

    /// Last cached descriptor for the node, or `None` when it has never
    /// been registered — the caller must collect launch details manually.
    pub async fn runtime_descriptor(&self, name: &str) -> Option<RuntimeDescriptor> {
        self.state.read().await.descriptors.get(name).cloned()
    }

    pub async fn running_entry(&self, name: &str) -> Option<RunningNode> {
        self.state.read().await.running.get(name).cloned()
    }

    /// A node counts as running only when the backend reports both the
    /// running flag and an assigned port.
    pub async fn is_running(&self, name: &str) -> bool {
        is_running_entry(self.state.read().await.running.get(name))
    }
}

fn is_running_entry(entry: Option<&RunningNode>) -> bool {
    entry.map(|e| e.running && e.port.is_some()).unwrap_or(false)
}

fn parse_catalog(
    raw: HashMap<String, HashMap<String, serde_json::Value>>,
) -> HashMap<String, TaskNode> {
    let mut nodes = HashMap::new();
    for (category, entries) in raw {
        for (name, value) in entries {
            let entry: CatalogEntry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(node = %name, error = %e, "skipping malformed catalog entry");
                    continue;
                }
            };
            nodes.insert(
                name.clone(),
                TaskNode {
                    name,
                    category: category.clone(),
                    description: entry.description,
                    icon: entry.icon,
                    inputs: entry.inputs,
                    outputs: entry.outputs,
                    runtime: entry.runtime,
                    running: entry.running,
                    activating: entry.activating,
                    log_path: entry.log_path,
                },
            );
        }
    }
    nodes
}

fn load_descriptor_cache(path: &PathBuf) -> HashMap<String, RuntimeDescriptor> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str(&content) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable descriptor cache");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

fn save_descriptor_cache(path: &PathBuf, descriptors: &HashMap<String, RuntimeDescriptor>) {
    let content = match serde_yaml::to_string(descriptors) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize descriptor cache");
            return;
        }
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, content) {
        tracing::warn!(path = %path.display(), error = %e, "failed to persist descriptor cache");
    }
}
