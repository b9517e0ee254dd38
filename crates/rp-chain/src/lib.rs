// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Chains: declarative DAGs of render steps.
//!
//! A chain spec (YAML or JSON) names steps, their templates, parameters
//! (possibly containing `{{ step.output.video }}` references), dependencies,
//! and optional conditions. The planner validates the spec and sorts it into
//! parallel levels; the resolver binds references against prior step results
//! at execution time.

/// Kahn planning into parallel levels.
pub mod planner;
/// Template resolution and condition evaluation.
pub mod resolve;
/// Chain spec types and parsing.
pub mod spec;

pub use planner::{plan, ExecutionNode, ExecutionPlan};
pub use resolve::{build_context, evaluate_condition, resolve_parameters};
pub use spec::{ChainSpec, ChainStep};

/// Spec-level validation failures; surfaced to the submitter, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainValidationError {
    /// The document failed to parse.
    #[error("invalid chain spec: {0}")]
    Parse(String),

    /// A step id is empty or carries characters outside `[A-Za-z0-9_-]`.
    #[error("invalid step id '{0}': must match [A-Za-z0-9_-]+")]
    InvalidStepId(String),

    /// Two steps share an id.
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// A dependency names a step that does not exist.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// The depending step.
        step: String,
        /// The missing target.
        dependency: String,
    },

    /// The dependency graph has a cycle.
    #[error("chain contains a dependency cycle through: {0:?}")]
    Cycle(Vec<String>),
}

/// Template/condition resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateResolutionError {
    /// A `{{ ... }}` reference points at nothing in the context.
    #[error("unresolvable reference '{reference}' in '{expression}'")]
    UnknownReference {
        /// The dotted path that failed.
        reference: String,
        /// The full expression it appeared in.
        expression: String,
    },

    /// A condition did not reduce to a boolean comparison.
    #[error("invalid condition '{expression}': {reason}")]
    InvalidCondition {
        /// The condition text.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },
}
