// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parameter validation against the override contract.
//!
//! The override file is the whole contract: a key present there is editable,
//! a key absent is frozen. Values are checked by nominal type; integers pass
//! where a float is expected.

use rp_core::params::json_type_name;
use rp_registry::TemplateRegistry;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// One invalid parameter, with enough detail for the error response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ParameterIssue {
    /// The offending key.
    pub key: String,
    /// What is wrong.
    pub reason: String,
}

/// Check every provided parameter; returns every issue, never just the
/// first.
pub fn validate_parameters(
    registry: &TemplateRegistry,
    workflow_name: &str,
    provided: &BTreeMap<String, Value>,
) -> Vec<ParameterIssue> {
    let Some(known) = registry.parameters(workflow_name) else {
        return provided
            .keys()
            .map(|key| ParameterIssue {
                key: key.clone(),
                reason: format!("workflow '{workflow_name}' not found in registry"),
            })
            .collect();
    };
    let by_key: BTreeMap<&str, &rp_registry::WorkflowParameter> =
        known.iter().map(|p| (p.key.as_str(), p)).collect();

    let mut issues = Vec::new();
    for (key, value) in provided {
        let Some(param) = by_key.get(key.as_str()) else {
            issues.push(ParameterIssue {
                key: key.clone(),
                reason: "not editable (not present in the override file)".to_string(),
            });
            continue;
        };
        if !param.value_type.accepts(value) {
            issues.push(ParameterIssue {
                key: key.clone(),
                reason: format!(
                    "must be a {}, got {}",
                    param.value_type.human_name(),
                    json_type_name(value)
                ),
            });
        }
    }
    issues
}
