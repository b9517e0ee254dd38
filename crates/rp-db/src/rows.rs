// SPDX-License-Identifier: MIT OR Apache-2.0
//! Row types and their column mapping.
//!
//! Timestamps are RFC 3339 TEXT, JSON documents are TEXT, statuses are the
//! stored string forms from `rp_core::status`. Decoding is explicit: an
//! unknown status string is a [`MetadataStoreError::Corrupt`], never a
//! silent default.

use crate::MetadataStoreError;
use chrono::{DateTime, Utc};
use rp_core::{
    ApprovalRequestStatus, ArtifactApprovalStatus, ChainStatus, JobStatus, MediaKind,
    TransferStatus,
};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// One DAG execution.
#[derive(Clone, Debug, Serialize)]
pub struct ChainRow {
    /// Row id (UUID).
    pub id: String,
    /// Chain name from the spec.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Durable-engine workflow id driving this chain.
    pub engine_workflow_id: Option<String>,
    /// Durable-engine run id.
    pub engine_run_id: Option<String>,
    /// Lifecycle status.
    pub status: ChainStatus,
    /// Level currently (or last) in flight.
    pub current_level: i64,
    /// The DAG as submitted.
    pub definition: Option<Value>,
    /// When execution began.
    pub started_at: DateTime<Utc>,
    /// When the chain reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure detail.
    pub error_message: Option<String>,
    /// Row audit stamps.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a chain row.
#[derive(Clone, Debug)]
pub struct NewChain {
    /// Chain name.
    pub name: String,
    /// Description, if any.
    pub description: Option<String>,
    /// Engine workflow id.
    pub engine_workflow_id: Option<String>,
    /// Engine run id.
    pub engine_run_id: Option<String>,
    /// The submitted DAG.
    pub definition: Option<Value>,
}

pub(crate) fn chain_from_row(row: &SqliteRow) -> crate::Result<ChainRow> {
    let status_raw: String = row.try_get("status")?;
    let status = ChainStatus::parse(&status_raw)
        .ok_or_else(|| MetadataStoreError::Corrupt(format!("chain status '{status_raw}'")))?;
    Ok(ChainRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        engine_workflow_id: row.try_get("engine_workflow_id")?,
        engine_run_id: row.try_get("engine_run_id")?,
        status,
        current_level: row.try_get("current_level")?,
        definition: json_column(row, "definition")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One render on one backend; standalone or one step of a chain.
#[derive(Clone, Debug, Serialize)]
pub struct JobRow {
    /// Row id (UUID).
    pub id: String,
    /// Owning chain, when the job is a chain step.
    pub chain_id: Option<String>,
    /// Step id within the chain.
    pub step_id: Option<String>,
    /// Template name executed.
    pub workflow_name: String,
    /// Backend the job ran (or will run) on.
    pub backend_address: String,
    /// The backend's opaque prompt id, once known.
    pub backend_prompt_id: Option<String>,
    /// Durable-engine workflow id driving this job.
    pub engine_workflow_id: Option<String>,
    /// Durable-engine run id.
    pub engine_run_id: Option<String>,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Denormalised pointer at the unique latest artifact.
    pub latest_artifact_id: Option<String>,
    /// Fully-bound job spec sent to the backend.
    pub definition: Option<Value>,
    /// Resolved override parameters.
    pub parameters: Option<Value>,
    /// Queue time.
    pub queued_at: DateTime<Utc>,
    /// Execution start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure detail, verbatim from the backend where applicable.
    pub error_message: Option<String>,
    /// Row audit stamps.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a job row.
#[derive(Clone, Debug, Default)]
pub struct NewJob {
    /// Owning chain, when a chain step.
    pub chain_id: Option<String>,
    /// Step id within the chain.
    pub step_id: Option<String>,
    /// Template name.
    pub workflow_name: String,
    /// Target backend.
    pub backend_address: String,
    /// Engine workflow id.
    pub engine_workflow_id: Option<String>,
    /// Engine run id.
    pub engine_run_id: Option<String>,
    /// Bound job spec.
    pub definition: Option<Value>,
    /// Resolved parameters.
    pub parameters: Option<Value>,
}

pub(crate) fn job_from_row(row: &SqliteRow) -> crate::Result<JobRow> {
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| MetadataStoreError::Corrupt(format!("job status '{status_raw}'")))?;
    Ok(JobRow {
        id: row.try_get("id")?,
        chain_id: row.try_get("chain_id")?,
        step_id: row.try_get("step_id")?,
        workflow_name: row.try_get("workflow_name")?,
        backend_address: row.try_get("backend_address")?,
        backend_prompt_id: row.try_get("backend_prompt_id")?,
        engine_workflow_id: row.try_get("engine_workflow_id")?,
        engine_run_id: row.try_get("engine_run_id")?,
        status,
        latest_artifact_id: row.try_get("latest_artifact_id")?,
        definition: json_column(row, "definition")?,
        parameters: json_column(row, "parameters")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// One output file produced by a job.
#[derive(Clone, Debug, Serialize)]
pub struct ArtifactRow {
    /// Row id (UUID).
    pub id: String,
    /// Producing job.
    pub job_id: String,
    /// Filename as the backend produced it.
    pub original_filename: String,
    /// Globally-unique local filename.
    pub local_filename: String,
    /// Absolute path in the artifact store.
    pub local_path: String,
    /// Media classification.
    pub file_type: MediaKind,
    /// Extension-derived format (`png`, `mp4`).
    pub file_format: Option<String>,
    /// Size in bytes.
    pub file_size: Option<i64>,
    /// Producing node id.
    pub node_id: Option<String>,
    /// Backend subfolder the file came from.
    pub subfolder: String,
    /// Which backend folder kind produced it.
    pub backend_folder_kind: String,
    /// Version number, 1-based.
    pub version: i64,
    /// Whether this is the job's current artifact.
    pub is_latest: bool,
    /// Previous version, for regenerated/edited artifacts.
    pub parent_artifact_id: Option<String>,
    /// Approval disposition.
    pub approval_status: ArtifactApprovalStatus,
    /// Who decided.
    pub approver: Option<String>,
    /// When the decision landed.
    pub decided_at: Option<DateTime<Utc>>,
    /// Reason attached to a rejection.
    pub rejection_reason: Option<String>,
    /// Free-form metadata.
    pub metadata: Option<Value>,
    /// Row audit stamps.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating an artifact row.
#[derive(Clone, Debug)]
pub struct NewArtifact {
    /// Producing job.
    pub job_id: String,
    /// Backend filename.
    pub original_filename: String,
    /// Local store filename.
    pub local_filename: String,
    /// Local store path.
    pub local_path: String,
    /// Media classification.
    pub file_type: MediaKind,
    /// Format, usually the extension.
    pub file_format: Option<String>,
    /// Size in bytes.
    pub file_size: Option<i64>,
    /// Producing node.
    pub node_id: Option<String>,
    /// Backend subfolder.
    pub subfolder: String,
    /// Backend folder kind.
    pub backend_folder_kind: String,
    /// Previous version; sets `version = parent.version + 1`.
    pub parent_artifact_id: Option<String>,
    /// Initial approval status.
    pub approval_status: ArtifactApprovalStatus,
    /// Free-form metadata.
    pub metadata: Option<Value>,
}

pub(crate) fn artifact_from_row(row: &SqliteRow) -> crate::Result<ArtifactRow> {
    let file_type_raw: String = row.try_get("file_type")?;
    let approval_raw: String = row.try_get("approval_status")?;
    let approval_status = ArtifactApprovalStatus::parse(&approval_raw).ok_or_else(|| {
        MetadataStoreError::Corrupt(format!("artifact approval status '{approval_raw}'"))
    })?;
    Ok(ArtifactRow {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        original_filename: row.try_get("original_filename")?,
        local_filename: row.try_get("local_filename")?,
        local_path: row.try_get("local_path")?,
        file_type: match file_type_raw.as_str() {
            "image" => MediaKind::Image,
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            _ => MediaKind::Unknown,
        },
        file_format: row.try_get("file_format")?,
        file_size: row.try_get("file_size")?,
        node_id: row.try_get("node_id")?,
        subfolder: row.try_get("subfolder")?,
        backend_folder_kind: row.try_get("backend_folder_kind")?,
        version: row.try_get("version")?,
        is_latest: row.try_get("is_latest")?,
        parent_artifact_id: row.try_get("parent_artifact_id")?,
        approval_status,
        approver: row.try_get("approver")?,
        decided_at: row.try_get("decided_at")?,
        rejection_reason: row.try_get("rejection_reason")?,
        metadata: json_column(row, "metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// Artifact transfer
// ---------------------------------------------------------------------------

/// Upload of an artifact's bytes to a target backend's input folder.
#[derive(Clone, Debug, Serialize)]
pub struct TransferRow {
    /// Row id (UUID).
    pub id: String,
    /// The transferred artifact.
    pub artifact_id: String,
    /// Job whose artifact moved.
    pub source_job_id: String,
    /// Consuming job, once known.
    pub target_job_id: Option<String>,
    /// Destination backend.
    pub target_backend: String,
    /// Destination subfolder under the input folder.
    pub target_subfolder: String,
    /// Lifecycle status.
    pub status: TransferStatus,
    /// Upload completion time.
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Failure detail.
    pub error_message: Option<String>,
    /// Row audit stamp.
    pub created_at: DateTime<Utc>,
}

/// Fields for creating a transfer row.
#[derive(Clone, Debug)]
pub struct NewTransfer {
    /// The artifact being moved.
    pub artifact_id: String,
    /// Source job.
    pub source_job_id: String,
    /// Consuming job, when known.
    pub target_job_id: Option<String>,
    /// Destination backend.
    pub target_backend: String,
    /// Destination subfolder.
    pub target_subfolder: String,
}

pub(crate) fn transfer_from_row(row: &SqliteRow) -> crate::Result<TransferRow> {
    let status_raw: String = row.try_get("status")?;
    let status = TransferStatus::parse(&status_raw)
        .ok_or_else(|| MetadataStoreError::Corrupt(format!("transfer status '{status_raw}'")))?;
    Ok(TransferRow {
        id: row.try_get("id")?,
        artifact_id: row.try_get("artifact_id")?,
        source_job_id: row.try_get("source_job_id")?,
        target_job_id: row.try_get("target_job_id")?,
        target_backend: row.try_get("target_backend")?,
        target_subfolder: row.try_get("target_subfolder")?,
        status,
        uploaded_at: row.try_get("uploaded_at")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Approval request
// ---------------------------------------------------------------------------

/// A pending human decision about one artifact.
#[derive(Clone, Debug, Serialize)]
pub struct ApprovalRequestRow {
    /// Row id (UUID).
    pub id: String,
    /// Artifact under review.
    pub artifact_id: String,
    /// Owning chain, when the gate sits in a chain step.
    pub chain_id: Option<String>,
    /// Step id within the chain.
    pub step_id: Option<String>,
    /// Workflow to signal with the decision.
    pub engine_workflow_id: String,
    /// Engine run id.
    pub engine_run_id: Option<String>,
    /// One-shot URL-safe token.
    pub token: String,
    /// Where approvers can view the artifact.
    pub view_url: String,
    /// Token expiry.
    pub link_expires_at: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: ApprovalRequestStatus,
    /// Who decided.
    pub decided_by: Option<String>,
    /// When the decision landed.
    pub decided_at: Option<DateTime<Utc>>,
    /// Workflow name, server, parameters used, approval policy.
    pub config_metadata: Value,
    /// Row audit stamp.
    pub created_at: DateTime<Utc>,
}

/// Fields for creating an approval request row.
#[derive(Clone, Debug)]
pub struct NewApprovalRequest {
    /// Artifact under review.
    pub artifact_id: String,
    /// Owning chain.
    pub chain_id: Option<String>,
    /// Step id.
    pub step_id: Option<String>,
    /// Workflow to signal.
    pub engine_workflow_id: String,
    /// Engine run id.
    pub engine_run_id: Option<String>,
    /// Freshly generated token.
    pub token: String,
    /// Artifact view URL.
    pub view_url: String,
    /// Token expiry.
    pub link_expires_at: Option<DateTime<Utc>>,
    /// Context metadata (workflow name, server, parameters, policy).
    pub config_metadata: Value,
}

pub(crate) fn approval_from_row(row: &SqliteRow) -> crate::Result<ApprovalRequestRow> {
    let status_raw: String = row.try_get("status")?;
    let status = ApprovalRequestStatus::parse(&status_raw)
        .ok_or_else(|| MetadataStoreError::Corrupt(format!("approval status '{status_raw}'")))?;
    Ok(ApprovalRequestRow {
        id: row.try_get("id")?,
        artifact_id: row.try_get("artifact_id")?,
        chain_id: row.try_get("chain_id")?,
        step_id: row.try_get("step_id")?,
        engine_workflow_id: row.try_get("engine_workflow_id")?,
        engine_run_id: row.try_get("engine_run_id")?,
        token: row.try_get("token")?,
        view_url: row.try_get("view_url")?,
        link_expires_at: row.try_get("link_expires_at")?,
        status,
        decided_by: row.try_get("decided_by")?,
        decided_at: row.try_get("decided_at")?,
        config_metadata: json_column(row, "config_metadata")?.unwrap_or(Value::Null),
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn json_column(row: &SqliteRow, name: &str) -> crate::Result<Option<Value>> {
    let raw: Option<String> = row.try_get(name)?;
    match raw {
        None => Ok(None),
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| MetadataStoreError::Corrupt(format!("column {name}: {e}"))),
    }
}

pub(crate) fn json_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}
