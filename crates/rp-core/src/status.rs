// SPDX-License-Identifier: MIT OR Apache-2.0
//! Status vocabularies for chains, jobs, artifacts, transfers, and approval
//! requests, with the transition rules the metadata store enforces.

use schemars::JsonSchema;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// ChainStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a chain row.
///
/// `ExecutingLevel(n)` is stored as the literal string `executing_level_<n>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ChainStatus {
    /// Chain row created, level 0 not yet started.
    Initializing,
    /// Steps at the given level are in flight.
    ExecutingLevel(u32),
    /// Every level joined successfully.
    Completed,
    /// A level failed; completed step results are preserved.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl ChainStatus {
    /// `true` for completed/failed/cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChainStatus::Completed | ChainStatus::Failed | ChainStatus::Cancelled
        )
    }

    /// The stored string form.
    pub fn as_string(&self) -> String {
        match self {
            ChainStatus::Initializing => "initializing".to_string(),
            ChainStatus::ExecutingLevel(n) => format!("executing_level_{n}"),
            ChainStatus::Completed => "completed".to_string(),
            ChainStatus::Failed => "failed".to_string(),
            ChainStatus::Cancelled => "cancelled".to_string(),
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(ChainStatus::Initializing),
            "completed" => Some(ChainStatus::Completed),
            "failed" => Some(ChainStatus::Failed),
            "cancelled" => Some(ChainStatus::Cancelled),
            other => other
                .strip_prefix("executing_level_")
                .and_then(|n| n.parse().ok())
                .map(ChainStatus::ExecutingLevel),
        }
    }

    /// Monotone advancement check: terminal states accept nothing, levels
    /// only advance forward.
    pub fn can_transition_to(&self, next: ChainStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (ChainStatus::Initializing, ChainStatus::Initializing) => false,
            (ChainStatus::Initializing, _) => true,
            (ChainStatus::ExecutingLevel(cur), ChainStatus::ExecutingLevel(n)) => n > *cur,
            (ChainStatus::ExecutingLevel(_), ChainStatus::Initializing) => false,
            (ChainStatus::ExecutingLevel(_), _) => true,
            _ => false,
        }
    }
}

impl Serialize for ChainStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for ChainStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChainStatus::parse(&s).ok_or_else(|| D::Error::custom(format!("unknown chain status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a job row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Row created, not yet submitted.
    Queued,
    /// Submitted to a backend and being tracked.
    Executing,
    /// Backend reported success and downloads finished.
    Completed,
    /// Terminal failure.
    Failed,
    /// Skipped by a chain condition or approval policy.
    Skipped,
    /// Cancelled by request.
    Cancelled,
}

impl JobStatus {
    /// `true` once the job has a final disposition. Note that `completed`
    /// can still re-enter `executing`: approval-driven regeneration re-runs
    /// the same job row and versions its artifacts.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    /// Legal successor states. Progression is monotone except that only
    /// `failed`, `skipped`, and `cancelled` are dead ends.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Queued => &[
                JobStatus::Executing,
                JobStatus::Failed,
                JobStatus::Skipped,
                JobStatus::Cancelled,
            ],
            JobStatus::Executing => {
                &[JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled]
            }
            JobStatus::Completed => &[JobStatus::Executing, JobStatus::Cancelled],
            _ => &[],
        }
    }

    /// `true` when moving from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "executing" => Some(JobStatus::Executing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "skipped" => Some(JobStatus::Skipped),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ArtifactApprovalStatus
// ---------------------------------------------------------------------------

/// Approval disposition stamped on an artifact row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved by a human.
    Approved,
    /// Rejected by a human.
    Rejected,
    /// No gate applied; approved implicitly on insert.
    #[default]
    AutoApproved,
    /// Superseded by a human-edited replacement.
    Edited,
}

impl ArtifactApprovalStatus {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactApprovalStatus::Pending => "pending",
            ArtifactApprovalStatus::Approved => "approved",
            ArtifactApprovalStatus::Rejected => "rejected",
            ArtifactApprovalStatus::AutoApproved => "auto_approved",
            ArtifactApprovalStatus::Edited => "edited",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "auto_approved" => Some(Self::AutoApproved),
            "edited" => Some(Self::Edited),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TransferStatus
// ---------------------------------------------------------------------------

/// Lifecycle of an artifact transfer row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Row created, upload not yet started.
    Pending,
    /// Upload in flight.
    Uploading,
    /// Bytes confirmed present in the target input folder.
    Completed,
    /// Upload failed after retries.
    Failed,
}

impl TransferStatus {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Uploading => "uploading",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalRequestStatus
// ---------------------------------------------------------------------------

/// Lifecycle of an approval request row; pending becomes terminal exactly
/// once, and the token validates only while pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRequestStatus {
    /// Waiting for a decision.
    Pending,
    /// Approved.
    Approved,
    /// Rejected.
    Rejected,
    /// Cancelled (e.g. the chain was cancelled while waiting).
    Cancelled,
}

impl ApprovalRequestStatus {
    /// `true` for anything but pending.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalRequestStatus::Pending)
    }

    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalRequestStatus::Pending => "pending",
            ApprovalRequestStatus::Approved => "approved",
            ApprovalRequestStatus::Rejected => "rejected",
            ApprovalRequestStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // ChainStatus
    // -----------------------------------------------------------------------

    #[test]
    fn chain_status_level_string_roundtrip() {
        let s = ChainStatus::ExecutingLevel(3);
        assert_eq!(s.as_string(), "executing_level_3");
        assert_eq!(ChainStatus::parse("executing_level_3"), Some(s));
    }

    #[test]
    fn chain_status_serde_uses_stored_form() {
        let json = serde_json::to_string(&ChainStatus::ExecutingLevel(0)).unwrap();
        assert_eq!(json, "\"executing_level_0\"");
        let back: ChainStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, ChainStatus::Failed);
    }

    #[test]
    fn chain_status_rejects_unknown() {
        assert!(serde_json::from_str::<ChainStatus>("\"resting\"").is_err());
        assert!(ChainStatus::parse("executing_level_x").is_none());
    }

    #[test]
    fn chain_levels_advance_monotonically() {
        let l1 = ChainStatus::ExecutingLevel(1);
        assert!(l1.can_transition_to(ChainStatus::ExecutingLevel(2)));
        assert!(!l1.can_transition_to(ChainStatus::ExecutingLevel(1)));
        assert!(!l1.can_transition_to(ChainStatus::ExecutingLevel(0)));
        assert!(l1.can_transition_to(ChainStatus::Completed));
        assert!(!ChainStatus::Completed.can_transition_to(ChainStatus::Failed));
    }

    // -----------------------------------------------------------------------
    // JobStatus
    // -----------------------------------------------------------------------

    #[test]
    fn job_dead_ends_have_no_transitions() {
        for s in [JobStatus::Failed, JobStatus::Skipped, JobStatus::Cancelled] {
            assert!(s.is_terminal());
            assert!(s.valid_transitions().is_empty());
        }
    }

    #[test]
    fn completed_job_can_re_execute_for_regeneration() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Completed.can_transition_to(JobStatus::Executing));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Executing));
    }

    #[test]
    fn job_queued_cannot_jump_to_completed() {
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Executing));
        assert!(JobStatus::Executing.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn job_status_parse_roundtrip() {
        for s in [
            JobStatus::Queued,
            JobStatus::Executing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Skipped,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
    }

    // -----------------------------------------------------------------------
    // Approval request status
    // -----------------------------------------------------------------------

    #[test]
    fn approval_request_pending_is_only_live_state() {
        assert!(!ApprovalRequestStatus::Pending.is_terminal());
        assert!(ApprovalRequestStatus::Approved.is_terminal());
        assert!(ApprovalRequestStatus::Rejected.is_terminal());
        assert!(ApprovalRequestStatus::Cancelled.is_terminal());
    }

    #[test]
    fn artifact_approval_default_is_auto_approved() {
        assert_eq!(
            ArtifactApprovalStatus::default(),
            ArtifactApprovalStatus::AutoApproved
        );
    }
}
