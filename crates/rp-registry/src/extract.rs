// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parameter extraction, categorisation, and output-node detection.
//!
//! A template is a map of node id → `{class_type, _meta?, inputs}`. Inputs
//! holding a list are node-to-node wiring (`["5", 0]`); everything else is a
//! mutable parameter.

use crate::RegistryError;
use rp_core::{MediaKind, NominalType, ParamValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// One overridable parameter, as stored in the override file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowParameter {
    /// Full key: `"<node_id>.<input_key>"`.
    pub key: String,
    /// Node id.
    pub node_id: String,
    /// Input key within the node.
    pub input_key: String,
    /// Default value from the template.
    pub default_value: Value,
    /// Nominal type of the default.
    #[serde(rename = "type")]
    pub value_type: NominalType,
    /// Node class.
    pub node_class: String,
    /// Human-readable node title.
    pub node_title: String,
    /// User-editable description.
    #[serde(default)]
    pub description: String,
    /// Parameter category for grouping.
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "other".to_string()
}

/// The template's terminal save node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutput {
    /// Node id producing the output.
    pub node_id: String,
    /// Whether the node saves video or images.
    pub output_type: MediaKind,
    /// Node class (`SaveImage`, `VHS_VideoCombine`, ...).
    pub node_class: String,
    /// Human-readable node title.
    pub node_title: String,
    /// Output format advertised by the node.
    #[serde(default)]
    pub format: String,
    /// Filename prefix/pattern the node uses.
    #[serde(default)]
    pub filename_prefix: String,
}

/// Save-node classes recognised as terminal outputs.
const OUTPUT_NODE_CLASSES: &[(&str, MediaKind)] = &[
    ("SaveVideo", MediaKind::Video),
    ("SaveImage", MediaKind::Image),
    ("PreviewImage", MediaKind::Image),
    ("VHS_VideoCombine", MediaKind::Video),
    ("SaveAnimatedWEBP", MediaKind::Image),
];

fn node_inputs(node: &Value) -> Option<&serde_json::Map<String, Value>> {
    node.get("inputs").and_then(Value::as_object)
}

fn node_title(node: &Value, class: &str) -> String {
    node.get("_meta")
        .and_then(|m| m.get("title"))
        .and_then(Value::as_str)
        .unwrap_or(class)
        .to_string()
}

/// Node ids never referenced as the first element of a list-valued input.
pub fn terminal_nodes(template: &Value) -> BTreeSet<String> {
    let Some(nodes) = template.as_object() else {
        return BTreeSet::new();
    };
    let all: BTreeSet<String> = nodes.keys().cloned().collect();
    let mut referenced = BTreeSet::new();
    for node in nodes.values() {
        let Some(inputs) = node_inputs(node) else {
            continue;
        };
        for value in inputs.values() {
            if let Some(items) = value.as_array() {
                if let Some(first) = items.first() {
                    let id = match first {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        _ => continue,
                    };
                    referenced.insert(id);
                }
            }
        }
    }
    all.difference(&referenced).cloned().collect()
}

/// Find the single terminal save node. `Ok(None)` when the template has no
/// output; [`RegistryError::AmbiguousOutput`] when it has several.
pub fn detect_output(
    template_name: &str,
    template: &Value,
) -> Result<Option<WorkflowOutput>, RegistryError> {
    let terminals = terminal_nodes(template);
    let mut outputs = Vec::new();

    for node_id in &terminals {
        let Some(node) = template.get(node_id.as_str()) else {
            continue;
        };
        let class = node
            .get("class_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some((_, kind)) = OUTPUT_NODE_CLASSES.iter().find(|(c, _)| *c == class) else {
            continue;
        };
        let inputs = node_inputs(node);
        let string_input = |key: &str| {
            inputs
                .and_then(|i| i.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        outputs.push(WorkflowOutput {
            node_id: node_id.clone(),
            output_type: *kind,
            node_class: class.to_string(),
            node_title: node_title(node, class),
            format: {
                let f = string_input("format");
                if f.is_empty() { "auto".to_string() } else { f }
            },
            filename_prefix: string_input("filename_prefix"),
        });
    }

    match outputs.len() {
        0 => Ok(None),
        1 => Ok(Some(outputs.remove(0))),
        _ => Err(RegistryError::AmbiguousOutput {
            template: template_name.to_string(),
            nodes: outputs.into_iter().map(|o| o.node_id).collect(),
        }),
    }
}

/// Every non-list input of every node, as an overridable parameter.
pub fn extract_parameters(template: &Value) -> Vec<WorkflowParameter> {
    let Some(nodes) = template.as_object() else {
        return Vec::new();
    };
    let mut parameters = Vec::new();
    for (node_id, node) in nodes {
        let class = node
            .get("class_type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let title = node_title(node, &class);
        let Some(inputs) = node_inputs(node) else {
            continue;
        };
        for (input_key, value) in inputs {
            // Lists are node wiring, not parameters.
            if value.is_array() {
                continue;
            }
            let Some(tagged) = ParamValue::from_json(value) else {
                continue;
            };
            parameters.push(WorkflowParameter {
                key: format!("{node_id}.{input_key}"),
                node_id: node_id.clone(),
                input_key: input_key.clone(),
                default_value: value.clone(),
                value_type: tagged.nominal_type(),
                node_class: class.clone(),
                node_title: title.clone(),
                description: describe(input_key, &class, &title),
                category: categorize(input_key),
            });
        }
    }
    parameters
}

/// Key-name-based category derivation.
pub fn categorize(input_key: &str) -> String {
    let key = input_key.to_ascii_lowercase();
    let category = if key.contains("text") || key.contains("prompt") {
        "prompts"
    } else if matches!(key.as_str(), "width" | "height" | "length" | "batch_size") {
        "dimensions"
    } else if key.contains("seed") {
        "generation"
    } else if matches!(
        key.as_str(),
        "steps" | "cfg" | "denoise" | "sampler_name" | "scheduler"
    ) {
        "sampling"
    } else if matches!(key.as_str(), "fps" | "frame" | "duration") {
        "video"
    } else if key.contains("image") || key.contains("video") {
        "media"
    } else if key.contains("model") || key.contains("lora") || key.contains("vae") {
        "models"
    } else {
        "other"
    };
    category.to_string()
}

fn describe(input_key: &str, node_class: &str, node_title: &str) -> String {
    let key = input_key.to_ascii_lowercase();
    if key.contains("text") {
        let title = node_title.to_ascii_lowercase();
        if title.contains("negative") {
            return "Negative prompt (what to avoid)".to_string();
        }
        if title.contains("positive") {
            return "Positive prompt (what to generate)".to_string();
        }
        return format!("Text input for {node_title}");
    }
    match input_key {
        "width" => "Output width in pixels".to_string(),
        "height" => "Output height in pixels".to_string(),
        "steps" => "Number of sampling steps".to_string(),
        "cfg" => "Classifier-free guidance scale".to_string(),
        "fps" => "Frames per second for video output".to_string(),
        _ if key.contains("seed") => "Random seed for reproducibility".to_string(),
        _ => format!("{input_key} parameter for {node_class}"),
    }
}
