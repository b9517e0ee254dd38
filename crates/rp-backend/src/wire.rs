// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire-contract types for the render backend HTTP + WebSocket API.

use rp_core::{FolderKind, OutputFile};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// HTTP bodies
// ---------------------------------------------------------------------------

/// Body of `POST /prompt`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptRequest {
    /// The fully-bound workflow document.
    pub prompt: Value,
    /// Caller identity; scopes WebSocket push messages.
    pub client_id: String,
}

/// Response of `POST /prompt`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptResponse {
    /// The backend's opaque id for the queued job.
    pub prompt_id: String,
    /// Queue position, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
}

/// One file reference inside a history `outputs` entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// Filename in the backend folder.
    pub filename: String,
    /// Subfolder, empty for the folder root.
    #[serde(default)]
    pub subfolder: String,
    /// Folder kind; the backend calls this `type`.
    #[serde(default, rename = "type")]
    pub kind: FolderKind,
}

/// Per-node outputs: `images`, `videos`, and whatever else the node emitted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Image outputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<OutputRef>,
    /// Video outputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<OutputRef>,
    /// Audio outputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<OutputRef>,
    /// Fields we pass through without interpreting.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The `status` object of a history entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryStatus {
    /// `"success"`, `"error"`, ...
    #[serde(default)]
    pub status_str: String,
    /// Whether the backend considers the entry finished.
    #[serde(default)]
    pub completed: bool,
    /// Message tuples; the second element of the first tuple is the error
    /// message on failures.
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl HistoryStatus {
    /// Pull the error message out of `messages`, falling back to a generic
    /// description.
    pub fn error_message(&self) -> String {
        self.messages
            .first()
            .and_then(|m| m.get(1))
            .and_then(Value::as_str)
            .unwrap_or("unknown backend error")
            .to_string()
    }
}

/// One prompt's history record.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Outputs keyed by producing node id.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    /// Terminal status.
    #[serde(default)]
    pub status: HistoryStatus,
}

impl HistoryEntry {
    /// Flatten `outputs` into the orchestrator's file list.
    pub fn output_files(&self) -> Vec<OutputFile> {
        let mut files = Vec::new();
        for (node_id, node) in &self.outputs {
            for r in node.images.iter().chain(&node.videos).chain(&node.audio) {
                files.push(OutputFile {
                    filename: r.filename.clone(),
                    subfolder: r.subfolder.clone(),
                    kind: r.kind,
                    node_id: node_id.clone(),
                });
            }
        }
        files
    }
}

/// Response of `GET /queue`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Entries currently executing.
    #[serde(default)]
    pub queue_running: Vec<Value>,
    /// Entries waiting.
    #[serde(default)]
    pub queue_pending: Vec<Value>,
}

impl QueueSnapshot {
    /// Total queue depth.
    pub fn total_load(&self) -> usize {
        self.queue_running.len() + self.queue_pending.len()
    }
}

/// Response of `POST /upload/image`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UploadAck {
    /// Server-assigned filename.
    pub name: String,
    /// Subfolder the file landed in.
    #[serde(default)]
    pub subfolder: String,
    /// Folder kind, as the backend reports it.
    #[serde(default, rename = "type")]
    pub kind: String,
}

// ---------------------------------------------------------------------------
// WebSocket push messages
// ---------------------------------------------------------------------------

/// One push message from `WS /ws`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushMessage {
    /// Message type (`executing`, `progress`, `execution_success`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
}

impl PushMessage {
    /// The prompt id scoping this message, when present.
    pub fn prompt_id(&self) -> Option<&str> {
        self.data.get("prompt_id").and_then(Value::as_str)
    }

    /// Node named by an `executing` message; `None` means the prompt
    /// finished its node walk.
    pub fn executing_node(&self) -> Option<&str> {
        self.data.get("node").and_then(Value::as_str)
    }

    /// Exception message of an `execution_error`.
    pub fn exception_message(&self) -> String {
        self.data
            .get("exception_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string()
    }
}

/// Push message types the tracker reacts to.
pub mod push_types {
    /// A node started (or finished, with null node) executing.
    pub const EXECUTING: &str = "executing";
    /// Progress counter frame.
    pub const PROGRESS: &str = "progress";
    /// The prompt completed successfully.
    pub const EXECUTION_SUCCESS: &str = "execution_success";
    /// The prompt failed.
    pub const EXECUTION_ERROR: &str = "execution_error";
    /// The prompt was interrupted.
    pub const EXECUTION_INTERRUPTED: &str = "execution_interrupted";
}
