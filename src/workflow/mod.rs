pub mod engine;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// One user-ordered workflow step, bound to a task node by type. Order in
/// the panel list is execution order; it becomes `step1..stepN` numbering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPanel {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub content: Map<String, Value>,
}

/// Parameter shape a node type expects on top of its generic parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PanelShape {
    /// Spatial nodes operate on a region; a bbox must be present.
    BoundingBox,
    /// Classifiers need their class list, even when empty.
    ClassList,
    Generic,
}

/// Recognized node-type shapes. Anything absent from this table serializes
/// its generic parameter set unchanged — never silently dropped.
const SHAPES: &[(&str, PanelShape)] = &[
    ("nucleus-detection", PanelShape::BoundingBox),
    ("tissue-detection", PanelShape::BoundingBox),
    ("gland-segmentation", PanelShape::BoundingBox),
    ("cell-classification", PanelShape::ClassList),
    ("tissue-classification", PanelShape::ClassList),
];

fn shape_for(node_type: &str) -> PanelShape {
    SHAPES
        .iter()
        .find(|(name, _)| *name == node_type)
        .map(|(_, shape)| *shape)
        .unwrap_or(PanelShape::Generic)
}

/// Serialize panels into a workflow-start payload:
/// `{target_path, step1: {model, input}, ..., stepN: {...}}`.
pub fn build_payload(panels: &[WorkflowPanel], target_path: &str) -> Value {
    let mut root = Map::new();
    root.insert("target_path".to_string(), Value::String(target_path.to_string()));
    for (i, panel) in panels.iter().enumerate() {
        root.insert(
            format!("step{}", i + 1),
            json!({
                "model": panel.node_type,
                "input": shape_input(panel),
            }),
        );
    }
    Value::Object(root)
}

/// Generic parameters pass through as-is; recognized shapes get their
/// required fields attached when the panel did not set them.
fn shape_input(panel: &WorkflowPanel) -> Value {
    let mut input = panel.content.clone();
    match shape_for(&panel.node_type) {
        PanelShape::BoundingBox => {
            input
                .entry("bbox")
                .or_insert(json!({ "x": 0, "y": 0, "width": 0, "height": 0 }));
        }
        PanelShape::ClassList => {
            input.entry("classes").or_insert(json!([]));
        }
        PanelShape::Generic => {}
    }
    Value::Object(input)
}

/// Read panels back out of a start payload, in step order. Inverse of
/// `build_payload` for panels whose required fields were already present.
pub fn panels_from_payload(payload: &Value) -> Vec<WorkflowPanel> {
    let mut panels = Vec::new();
    let mut n = 1;
    while let Some(step) = payload.get(format!("step{n}")) {
        let node_type = step
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let content = step
            .get("input")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        panels.push(WorkflowPanel {
            id: format!("step{n}"),
            node_type,
            content,
        });
        n += 1;
    }
    panels
}
