// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The metadata store: SQLite persistence for chains, jobs, artifacts,
//! artifact transfers, and approval requests.
//!
//! This is the single source of truth for cross-workflow state. Every
//! multi-row mutation runs inside one transaction. Inserting an artifact
//! flips `is_latest` off its siblings and repoints the job's
//! `latest_artifact_id` in the same commit, so "exactly one latest
//! artifact per job" holds at every commit point.

/// Row types and column mapping.
pub mod rows;
/// The store and its operations.
pub mod store;

pub use rows::{
    ApprovalRequestRow, ArtifactRow, ChainRow, JobRow, NewApprovalRequest, NewArtifact, NewChain,
    NewJob, NewTransfer, TransferRow,
};
pub use store::MetadataStore;

/// Metadata store failures.
#[derive(Debug, thiserror::Error)]
pub enum MetadataStoreError {
    /// Underlying database failure.
    #[error("metadata store: {0}")]
    Db(#[from] sqlx::Error),

    /// The requested row does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind (`chain`, `job`, ...).
        entity: &'static str,
        /// Row id.
        id: String,
    },

    /// A status write violated the transition rules.
    #[error("illegal {entity} transition {from} -> {to}")]
    InvalidTransition {
        /// Entity kind.
        entity: &'static str,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A stored value failed to decode (unknown status string, bad JSON).
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, MetadataStoreError>;
