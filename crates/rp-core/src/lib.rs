// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The stable contract for renderplane.
//!
//! Every other crate in the workspace speaks these types: job requests and
//! results, chain step results, status vocabularies with their legal
//! transitions, the error taxonomy, tagged parameter values, and the
//! canonical JSON serialisation used to hash workflow templates.

/// Canonical JSON serialisation and template hashing.
pub mod canonical;
/// The error taxonomy shared by activities and workflows.
pub mod error;
/// Tagged parameter values and nominal type checking.
pub mod params;
/// Status vocabularies and their transition tables.
pub mod status;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use error::{ErrorClass, OrchestratorError};
pub use params::{NominalType, ParamValue};
pub use status::{
    ApprovalRequestStatus, ArtifactApprovalStatus, ChainStatus, JobStatus, TransferStatus,
};

// ---------------------------------------------------------------------------
// Output files
// ---------------------------------------------------------------------------

/// Which backend-side folder a file lives in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FolderKind {
    /// The backend's render output folder.
    #[default]
    Output,
    /// The backend's upload/input folder.
    Input,
    /// The backend's scratch folder.
    Temp,
}

impl FolderKind {
    /// The query-string value the backend contract uses for this folder.
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderKind::Output => "output",
            FolderKind::Input => "input",
            FolderKind::Temp => "temp",
        }
    }
}

/// Broad media classification of an artifact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Still image (png, jpg, webp, ...).
    Image,
    /// Video (mp4, webm, mov, ...).
    Video,
    /// Audio (wav, mp3, flac, ...).
    Audio,
    /// Anything we cannot classify.
    #[default]
    Unknown,
}

impl MediaKind {
    /// Classify a filename by its extension.
    pub fn from_filename(filename: &str) -> Self {
        let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "webp" | "gif" | "bmp" | "tiff" => MediaKind::Image,
            "mp4" | "webm" | "mov" | "avi" | "mkv" => MediaKind::Video,
            "wav" | "mp3" | "flac" | "ogg" => MediaKind::Audio,
            _ => MediaKind::Unknown,
        }
    }

    /// Lowercase wire name (`"image"`, `"video"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Unknown => "unknown",
        }
    }
}

/// One output file reported by a backend's history, flattened out of the
/// per-node `outputs` map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputFile {
    /// Filename as the backend produced it.
    pub filename: String,
    /// Subfolder within the backend folder, empty for the root.
    #[serde(default)]
    pub subfolder: String,
    /// Which backend folder holds the file.
    #[serde(default)]
    pub kind: FolderKind,
    /// Id of the node that produced the file.
    pub node_id: String,
}

// ---------------------------------------------------------------------------
// Single-job contract
// ---------------------------------------------------------------------------

/// Backend selection strategy for the load balancer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Online backend with the smallest queue (running + pending).
    #[default]
    LeastLoaded,
    /// Rotate over the online backends.
    RoundRobin,
    /// Uniform pick over the online backends.
    Random,
}

/// Input to the single-job orchestration workflow.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct JobRequest {
    /// Fully-bound workflow document to submit.
    pub workflow_json: serde_json::Value,
    /// How to pick a backend when none is pre-selected.
    #[serde(default)]
    pub strategy: SelectionStrategy,
    /// Template name, when known; enables structured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    /// Backend chosen by an enclosing chain step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_selected_backend: Option<String>,
    /// Metadata-store job row to attach artifacts to. Absent for ephemeral
    /// one-off jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_db_id: Option<String>,
}

/// Output-descriptor-shaped summary of a finished job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StructuredOutput {
    /// The primary output filename, keyed by its media kind
    /// (`"video": "clip_00001.mp4"`).
    #[serde(flatten)]
    pub primary: BTreeMap<String, serde_json::Value>,
    /// Media kind of the primary output.
    pub kind: MediaKind,
    /// Output format advertised by the template's save node.
    pub format: String,
    /// Every file the backend reported.
    pub server_files: Vec<OutputFile>,
    /// Number of reported files.
    pub count: usize,
}

/// A locally-downloaded file available for preview.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocalPreview {
    /// Globally-unique local filename.
    pub local_filename: String,
    /// Absolute path in the artifact store.
    pub local_path: String,
    /// Filename as the backend produced it.
    pub original_filename: String,
}

/// Result of the single-job orchestration workflow.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct JobResult {
    /// Terminal job status.
    pub status: JobStatus,
    /// The backend's opaque prompt id, empty when submission never happened.
    #[serde(default)]
    pub prompt_id: String,
    /// Backend the job ran on, empty when selection never happened.
    #[serde(default)]
    pub backend: String,
    /// Structured output, when a registry descriptor was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StructuredOutput>,
    /// Locally-stored copies of the outputs.
    #[serde(default)]
    pub local_preview: Vec<LocalPreview>,
    /// Error message for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Live progress snapshot forwarded by the execution tracker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressUpdate {
    /// Prompt being tracked.
    pub prompt_id: String,
    /// Node currently executing, if the backend reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    /// Progress counter value, when the backend pushes `progress` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    /// Progress counter maximum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

// ---------------------------------------------------------------------------
// Chain step contract
// ---------------------------------------------------------------------------

/// Terminal disposition of a chain step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step ran to completion.
    Completed,
    /// Step failed (backend error, transfer failure, approval stop, ...).
    Failed,
    /// Step was skipped by its condition or by approval policy.
    Skipped,
}

/// Result of one chain step, keyed by `step_id` in the chain result.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct StepResult {
    /// Step identifier from the chain spec.
    pub step_id: String,
    /// Template the step executed.
    pub workflow: String,
    /// Terminal disposition.
    pub status: StepStatus,
    /// Structured output of the underlying job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StructuredOutput>,
    /// Parameters after template resolution, as sent to the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    /// Backend the job ran on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Metadata-store job row for the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_db_id: Option<String>,
    /// Error message for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a whole chain execution.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ChainRunResult {
    /// Chain name from the spec.
    pub chain_name: String,
    /// `completed` or `failed`; completed steps are preserved either way.
    pub status: String,
    /// Per-step results keyed by step id.
    pub step_results: BTreeMap<String, StepResult>,
    /// Error message when the chain failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Approval contract
// ---------------------------------------------------------------------------

/// What to do when an approver rejects an artifact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OnRejected {
    /// Fail the step (default).
    #[default]
    Stop,
    /// Mark the step skipped and continue the chain.
    Skip,
    /// Re-run the step with the parameters supplied at rejection.
    Regenerate,
}

/// What to do when no decision arrives before the deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Treat the artifact as rejected (default).
    #[default]
    AutoReject,
    /// Treat the artifact as approved.
    AutoApprove,
}

/// Approval policy attached to a chain step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalPolicy {
    /// Hours to wait for a decision.
    #[serde(default = "ApprovalPolicy::default_timeout_hours")]
    pub timeout_hours: f64,
    /// Reaction to a rejection.
    #[serde(default)]
    pub on_rejected: OnRejected,
    /// Regeneration attempts allowed before `on_rejected` degrades to stop.
    #[serde(default)]
    pub max_retries: u32,
    /// Reaction to a timeout.
    #[serde(default)]
    pub timeout_action: TimeoutAction,
}

impl ApprovalPolicy {
    fn default_timeout_hours() -> f64 {
        24.0
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            timeout_hours: Self::default_timeout_hours(),
            on_rejected: OnRejected::default(),
            max_retries: 0,
            timeout_action: TimeoutAction::default(),
        }
    }
}

/// An approval decision delivered to a waiting chain workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalDecision {
    /// `"approved"` or `"rejected"`.
    pub decision: String,
    /// Identifier of whoever decided.
    pub decided_by: String,
    /// Replacement parameters for regeneration (rejections only).
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Free-form comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ApprovalDecision {
    /// Decision string for approvals.
    pub const APPROVED: &'static str = "approved";
    /// Decision string for rejections.
    pub const REJECTED: &'static str = "rejected";

    /// `true` when this decision approves the artifact.
    pub fn is_approved(&self) -> bool {
        self.decision == Self::APPROVED
    }
}

/// Helper for audit timestamps; serialised as RFC 3339.
pub fn now_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Name of the signal that delivers an [`ApprovalDecision`] to a chain
/// workflow. Scoped per step so parallel steps waiting on approval never
/// steal each other's decisions.
pub fn approval_signal_name(step_id: Option<&str>) -> String {
    match step_id {
        Some(step) => format!("approval_decision:{step}"),
        None => "approval_decision".to_string(),
    }
}
