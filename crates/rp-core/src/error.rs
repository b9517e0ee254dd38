// SPDX-License-Identifier: MIT OR Apache-2.0
//! The error taxonomy shared across the workspace.
//!
//! Activities classify their failures so the durable engine knows what to
//! retry: transient classes (network, backend 5xx, store hiccups) retry per
//! policy, permanent classes (validation, execution errors) surface to the
//! workflow immediately.

use serde::{Deserialize, Serialize};

/// Coarse classification of orchestrator failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input: unknown override, unknown template, cyclic chain,
    /// unresolvable expression, invalid approval parameters.
    Validation,
    /// Unknown chain/job/artifact/approval.
    NotFound,
    /// The balancer found no online backend.
    NoBackendAvailable,
    /// Non-2xx response from a backend.
    Backend,
    /// Connection-level failure talking to a backend.
    Network,
    /// A call exceeded its deadline.
    Timeout,
    /// The tracker exceeded its overall deadline.
    Tracking,
    /// The backend reported a failed render; retrying the same inputs fails
    /// the same way.
    Execution,
    /// An approver rejected and policy says stop.
    ApprovalRejected,
    /// The approval wait expired.
    ApprovalTimeout,
    /// Artifact or metadata store failure.
    Store,
}

impl ErrorClass {
    /// `true` when a retry with the same inputs can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::NoBackendAvailable
                | ErrorClass::Backend
                | ErrorClass::Network
                | ErrorClass::Timeout
                | ErrorClass::Store
        )
    }
}

/// A classified orchestrator error.
///
/// Library crates keep their own `thiserror` enums; this is the shape those
/// errors collapse to at the workflow/activity boundary, where class decides
/// retry behaviour and the message is what lands in `error_message` columns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{class:?}: {message}")]
pub struct OrchestratorError {
    /// Failure class.
    pub class: ErrorClass,
    /// Human-readable detail, recorded verbatim on the failed row.
    pub message: String,
}

impl OrchestratorError {
    /// Construct with an explicit class.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    /// Missing entity.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    /// No online backend.
    pub fn no_backend(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NoBackendAvailable, message)
    }

    /// Backend rejected a request.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Backend, message)
    }

    /// Render execution failed on the backend.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Execution, message)
    }

    /// Store trouble.
    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Store, message)
    }

    /// `true` when the engine may retry this failure.
    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}
