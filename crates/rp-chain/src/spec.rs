// SPDX-License-Identifier: MIT OR Apache-2.0
//! Chain spec types and parsing.

use crate::ChainValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One step of a chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    /// Unique step id, `[A-Za-z0-9_-]+`.
    pub id: String,
    /// Template name to execute.
    pub workflow: String,
    /// Parameters; string values may carry `{{ ... }}` references.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Step ids this step consumes outputs from.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional condition; on false the step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A whole chain spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    /// Chain name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The steps.
    pub steps: Vec<ChainStep>,
    /// Free-form metadata (tags, version, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ChainSpec {
    /// Parse a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ChainValidationError> {
        let spec: ChainSpec =
            serde_yaml::from_str(text).map_err(|e| ChainValidationError::Parse(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse a JSON value (the HTTP surface submits chains as JSON).
    pub fn from_json(value: Value) -> Result<Self, ChainValidationError> {
        let spec: ChainSpec = serde_json::from_value(value)
            .map_err(|e| ChainValidationError::Parse(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Structural validation: id charset, uniqueness, known dependencies.
    /// Cycle detection happens in the planner, which walks the graph anyway.
    pub fn validate(&self) -> Result<(), ChainValidationError> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() || !step.id.chars().all(valid_id_char) {
                return Err(ChainValidationError::InvalidStepId(step.id.clone()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ChainValidationError::DuplicateStepId(step.id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(ChainValidationError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn valid_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PIPELINE_YAML: &str = r#"
name: image-to-video
description: Generate an image, then animate it
steps:
  - id: generate
    workflow: txt2img
    parameters:
      "3.text": "a lighthouse at dusk"
  - id: animate
    workflow: img2vid
    depends_on: [generate]
    parameters:
      "12.image": "{{ generate.output.image }}"
    condition: "{{ generate.status }} == 'completed'"
"#;

    #[test]
    fn yaml_chain_parses() {
        let spec = ChainSpec::from_yaml(PIPELINE_YAML).unwrap();
        assert_eq!(spec.name, "image-to-video");
        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[1].depends_on, vec!["generate"]);
        assert!(spec.steps[1].condition.is_some());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err = ChainSpec::from_json(json!({
            "name": "c",
            "steps": [
                {"id": "a", "workflow": "w"},
                {"id": "a", "workflow": "w"}
            ]
        }))
        .unwrap_err();
        assert_eq!(err, ChainValidationError::DuplicateStepId("a".into()));
    }

    #[test]
    fn bad_id_charset_rejected() {
        let err = ChainSpec::from_json(json!({
            "name": "c",
            "steps": [{"id": "a b", "workflow": "w"}]
        }))
        .unwrap_err();
        assert!(matches!(err, ChainValidationError::InvalidStepId(_)));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = ChainSpec::from_json(json!({
            "name": "c",
            "steps": [{"id": "a", "workflow": "w", "depends_on": ["ghost"]}]
        }))
        .unwrap_err();
        assert_eq!(
            err,
            ChainValidationError::UnknownDependency {
                step: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn bad_yaml_is_a_parse_error() {
        assert!(matches!(
            ChainSpec::from_yaml("steps: ["),
            Err(ChainValidationError::Parse(_))
        ));
    }
}
