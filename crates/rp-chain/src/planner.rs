// SPDX-License-Identifier: MIT OR Apache-2.0
//! Kahn planning: sort a validated chain into parallel levels.
//!
//! `levels[i]` holds the step ids whose remaining in-degree reaches zero
//! after removing all earlier levels, so steps within a level have no edges
//! between them and every dependency sits at a strictly lower level. The
//! plan is a plain value; the chain workflow receives it as input.

use crate::spec::ChainSpec;
use crate::ChainValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// One step of the plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNode {
    /// Step id.
    pub step_id: String,
    /// Template name to execute.
    pub workflow: String,
    /// Unresolved parameters, templates intact.
    pub parameters: Map<String, Value>,
    /// Optional condition expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Upstream step ids.
    pub dependencies: BTreeSet<String>,
    /// Execution level.
    pub level: u32,
}

/// A validated, level-sorted plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Chain name.
    pub chain_name: String,
    /// Chain description, carried for the chain row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Nodes keyed by step id.
    pub nodes: BTreeMap<String, ExecutionNode>,
    /// Step ids per level; levels execute in order, members in parallel.
    pub levels: Vec<Vec<String>>,
    /// Direct dependencies per step.
    pub dependency_graph: BTreeMap<String, BTreeSet<String>>,
}

impl ExecutionPlan {
    /// Node lookup.
    pub fn node(&self, step_id: &str) -> Option<&ExecutionNode> {
        self.nodes.get(step_id)
    }

    /// Number of levels.
    pub fn total_levels(&self) -> usize {
        self.levels.len()
    }

    /// All step ids, in level order.
    pub fn step_ids(&self) -> Vec<String> {
        self.levels.iter().flatten().cloned().collect()
    }
}

/// Validate and plan a chain.
pub fn plan(spec: &ChainSpec) -> Result<ExecutionPlan, ChainValidationError> {
    spec.validate()?;

    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for step in &spec.steps {
        in_degree.insert(&step.id, step.depends_on.len());
        for dep in &step.depends_on {
            dependents.entry(dep).or_default().push(&step.id);
        }
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut placed: BTreeMap<String, u32> = BTreeMap::new();
    while placed.len() < spec.steps.len() {
        // Spec order within a level keeps the plan deterministic.
        let ready: Vec<&str> = spec
            .steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| !placed.contains_key(*id) && in_degree[id] == 0)
            .collect();
        if ready.is_empty() {
            let stuck: Vec<String> = spec
                .steps
                .iter()
                .map(|s| s.id.clone())
                .filter(|id| !placed.contains_key(id))
                .collect();
            return Err(ChainValidationError::Cycle(stuck));
        }
        let level = levels.len() as u32;
        for id in &ready {
            placed.insert((*id).to_string(), level);
            for dependent in dependents.get(id).into_iter().flatten() {
                *in_degree.get_mut(dependent).expect("dependent exists") -= 1;
            }
        }
        levels.push(ready.into_iter().map(str::to_string).collect());
    }

    let mut nodes = BTreeMap::new();
    let mut dependency_graph = BTreeMap::new();
    for step in &spec.steps {
        let dependencies: BTreeSet<String> = step.depends_on.iter().cloned().collect();
        dependency_graph.insert(step.id.clone(), dependencies.clone());
        nodes.insert(
            step.id.clone(),
            ExecutionNode {
                step_id: step.id.clone(),
                workflow: step.workflow.clone(),
                parameters: step.parameters.clone(),
                condition: step.condition.clone(),
                dependencies,
                level: placed[&step.id],
            },
        );
    }

    Ok(ExecutionPlan {
        chain_name: spec.name.clone(),
        description: spec.description.clone(),
        nodes,
        levels,
        dependency_graph,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ChainStep;
    use proptest::prelude::*;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> ChainStep {
        ChainStep {
            id: id.to_string(),
            workflow: "w".to_string(),
            parameters: Map::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            condition: None,
            description: None,
        }
    }

    fn chain(steps: Vec<ChainStep>) -> ChainSpec {
        ChainSpec {
            name: "test".to_string(),
            description: None,
            steps,
            metadata: Map::new(),
        }
    }

    #[test]
    fn diamond_plans_into_three_levels() {
        let spec = chain(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]);
        let plan = plan(&spec).unwrap();
        assert_eq!(plan.levels, vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
            vec!["d".to_string()],
        ]);
        assert_eq!(plan.node("d").unwrap().level, 2);
    }

    #[test]
    fn every_dependency_sits_at_a_lower_level() {
        let spec = chain(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &["a", "c"]),
            step("e", &[]),
        ]);
        let plan = plan(&spec).unwrap();
        for node in plan.nodes.values() {
            for dep in &node.dependencies {
                assert!(plan.node(dep).unwrap().level < node.level);
            }
        }
    }

    #[test]
    fn two_cycle_is_rejected() {
        let spec = chain(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = plan(&spec).unwrap_err();
        match err {
            ChainValidationError::Cycle(stuck) => {
                assert!(stuck.contains(&"a".to_string()));
                assert!(stuck.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_cycle_is_rejected() {
        let spec = chain(vec![step("a", &["a"])]);
        assert!(matches!(plan(&spec), Err(ChainValidationError::Cycle(_))));
    }

    #[test]
    fn plan_is_a_serialisable_value() {
        let spec = chain(vec![step("a", &[]), step("b", &["a"])]);
        let built = plan(&spec).unwrap();
        let round: ExecutionPlan =
            serde_json::from_value(serde_json::to_value(&built).unwrap()).unwrap();
        assert_eq!(round, built);
    }

    #[test]
    fn parameters_stay_unresolved_in_the_plan() {
        let mut with_template = step("b", &["a"]);
        with_template
            .parameters
            .insert("12.image".into(), json!("{{ a.output.image }}"));
        let spec = chain(vec![step("a", &[]), with_template]);
        let plan = plan(&spec).unwrap();
        assert_eq!(
            plan.node("b").unwrap().parameters["12.image"],
            json!("{{ a.output.image }}")
        );
    }

    // Random DAGs: edges only point from earlier to later spec indices, so
    // the graph is acyclic by construction and planning must succeed with
    // the levels partitioning the step set.
    proptest! {
        #[test]
        fn levels_partition_acyclic_chains(edge_bits in prop::collection::vec(any::<bool>(), 45)) {
            let n = 10usize;
            let mut steps = Vec::new();
            let mut bit = 0;
            for i in 0..n {
                let id = format!("s{i}");
                let mut deps = Vec::new();
                for j in 0..i {
                    if edge_bits[bit] {
                        deps.push(format!("s{j}"));
                    }
                    bit += 1;
                }
                steps.push(ChainStep {
                    id,
                    workflow: "w".to_string(),
                    parameters: Map::new(),
                    depends_on: deps,
                    condition: None,
                    description: None,
                });
            }
            let built = plan(&chain(steps)).unwrap();

            let mut seen = std::collections::HashSet::new();
            for level in &built.levels {
                for id in level {
                    prop_assert!(seen.insert(id.clone()), "step {} appears twice", id);
                }
            }
            prop_assert_eq!(seen.len(), n);
            for node in built.nodes.values() {
                for dep in &node.dependencies {
                    prop_assert!(built.node(dep).unwrap().level < node.level);
                }
            }
        }
    }
}
