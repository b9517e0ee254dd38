// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Durable workflow engine for renderplane.
//!
//! Workflows are deterministic async functions whose every side effect goes
//! through their [`WorkflowCtx`]: activities, timers, signal waits, child
//! workflows, and deterministic uuid/clock/random. Each effect is keyed by a
//! caller-supplied **command id**; its outcome is appended to the workflow's
//! history. After a crash the workflow function simply runs again: recorded
//! command ids short-circuit to their recorded outcomes, and execution
//! resumes live at the first unrecorded command. Because matching is by id
//! rather than log position, concurrent branches inside one workflow (steps
//! of a chain level) replay correctly regardless of completion order.
//!
//! Activities are the only place real I/O happens. They run under a retry
//! policy with exponential backoff, a start-to-close deadline, and an
//! optional heartbeat watchdog.

/// Activity trait, context, and error classification.
pub mod activity;
/// The engine: run registry, handles, signals, queries, resume.
pub mod engine;
/// History events and stores.
pub mod history;
/// Retry policies and activity options.
pub mod retry;
/// The workflow-side context.
pub mod context;

pub use activity::{Activity, ActivityContext, ActivityError};
pub use context::WorkflowCtx;
pub use engine::{Engine, WorkflowDef, WorkflowHandle};
pub use history::{FileHistoryStore, HistoryEvent, HistoryStore, InMemoryHistoryStore, StoreError};
pub use retry::{ActivityOptions, RetryPolicy};

use serde_json::Value;

/// Errors surfaced to workflow code and engine callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An activity exhausted its retries or failed permanently.
    #[error("activity '{activity}' failed: {error}")]
    ActivityFailed {
        /// Registered activity name.
        activity: String,
        /// Final error message.
        error: String,
    },

    /// A child workflow exhausted its retries.
    #[error("child workflow '{child}' failed: {error}")]
    ChildFailed {
        /// Child workflow id.
        child: String,
        /// Final error message.
        error: String,
    },

    /// The workflow was cancelled.
    #[error("workflow cancelled")]
    Cancelled,

    /// A command id was reused or replay diverged from the recorded history.
    #[error("nondeterministic workflow: {0}")]
    Nondeterminism(String),

    /// No activity registered under the requested name.
    #[error("unknown activity '{0}'")]
    UnknownActivity(String),

    /// No workflow type registered under the requested name.
    #[error("unknown workflow type '{0}'")]
    UnknownWorkflow(String),

    /// No running or recorded workflow with the requested id.
    #[error("unknown workflow id '{0}'")]
    UnknownWorkflowId(String),

    /// The history store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The workflow body returned an error.
    #[error("workflow failed: {0}")]
    WorkflowFailed(String),
}

impl EngineError {
    /// Flatten to the message recorded in history and database rows.
    pub fn message(&self) -> String {
        match self {
            EngineError::ActivityFailed { error, .. } => error.clone(),
            EngineError::ChildFailed { error, .. } => error.clone(),
            other => other.to_string(),
        }
    }
}

/// Result alias for workflow bodies.
pub type WorkflowResult = Result<Value, EngineError>;
