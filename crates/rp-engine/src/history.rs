// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workflow histories: the events, the store trait, and the two bundled
//! stores (in-memory for tests, one-JSONL-file-per-workflow for the daemon).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One entry in a workflow's history log.
///
/// Everything a workflow can observe is replayable from these events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// The workflow was started.
    WorkflowStarted {
        /// Registered workflow type name.
        workflow_type: String,
        /// Input value handed to the workflow body.
        input: Value,
        /// Run id; seeds deterministic uuid derivation.
        run_id: String,
        /// Wall-clock start time (informational).
        started_at: DateTime<Utc>,
    },
    /// An activity completed and returned a value.
    ActivityCompleted {
        /// Command id.
        id: String,
        /// Registered activity name.
        name: String,
        /// Returned value.
        result: Value,
    },
    /// An activity failed permanently (or exhausted retries).
    ActivityFailed {
        /// Command id.
        id: String,
        /// Registered activity name.
        name: String,
        /// Final error message.
        error: String,
    },
    /// A durable timer was scheduled.
    TimerScheduled {
        /// Command id.
        id: String,
        /// Absolute fire time; survives restarts.
        fire_at: DateTime<Utc>,
    },
    /// A durable timer fired.
    TimerFired {
        /// Command id.
        id: String,
    },
    /// An external signal arrived.
    SignalReceived {
        /// Signal name.
        name: String,
        /// Payload.
        payload: Value,
    },
    /// A signal wait was scheduled with its absolute deadline.
    WaitScheduled {
        /// Command id.
        id: String,
        /// Absolute deadline, if the wait has one.
        deadline: Option<DateTime<Utc>>,
    },
    /// A signal wait resolved.
    WaitResolved {
        /// Command id.
        id: String,
        /// Signal name the wait was listening on.
        name: String,
        /// Consumed payload, or `None` on timeout.
        payload: Option<Value>,
    },
    /// A deterministic marker (clock reading, random value).
    MarkerRecorded {
        /// Command id.
        id: String,
        /// Recorded value.
        value: Value,
    },
    /// A child workflow completed.
    ChildCompleted {
        /// Command id.
        id: String,
        /// Child's result value.
        result: Value,
    },
    /// A child workflow failed after retries.
    ChildFailed {
        /// Command id.
        id: String,
        /// Final error message.
        error: String,
    },
    /// Cancellation was requested.
    CancelRequested,
    /// The workflow body returned successfully.
    WorkflowCompleted {
        /// Result value.
        result: Value,
    },
    /// The workflow body failed.
    WorkflowFailed {
        /// Error message.
        error: String,
    },
}

impl HistoryEvent {
    /// `true` for the two terminal events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HistoryEvent::WorkflowCompleted { .. } | HistoryEvent::WorkflowFailed { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// A history store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("history store io: {0}")]
    Io(#[from] std::io::Error),
    /// A history line could not be decoded.
    #[error("corrupt history for '{workflow_id}': {reason}")]
    Corrupt {
        /// Workflow whose history is damaged.
        workflow_id: String,
        /// Decode failure detail.
        reason: String,
    },
}

/// Durable, append-only storage of workflow histories.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one event to a workflow's history.
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> Result<(), StoreError>;

    /// Load a workflow's full history, oldest first. Empty for unknown ids.
    async fn load(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Ids of every workflow with recorded history.
    async fn list_workflows(&self) -> Result<Vec<String>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store for unit tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<HistoryEvent>>>,
}

impl InMemoryHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> Result<(), StoreError> {
        self.histories
            .lock()
            .expect("history lock poisoned")
            .entry(workflow_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>, StoreError> {
        Ok(self
            .histories
            .lock()
            .expect("history lock poisoned")
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_workflows(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .histories
            .lock()
            .expect("history lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// One JSONL file per workflow under a state directory.
///
/// Filenames are percent-free: workflow ids are restricted to
/// `[A-Za-z0-9._-]`; other bytes are mapped to `_`.
pub struct FileHistoryStore {
    root: PathBuf,
}

impl FileHistoryStore {
    /// Open (and create) the state directory.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        let safe: String = workflow_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.history.jsonl"))
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event).map_err(|e| StoreError::Corrupt {
            workflow_id: workflow_id.to_string(),
            reason: e.to_string(),
        })?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(workflow_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>, StoreError> {
        let path = self.path_for(workflow_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let event = serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
                workflow_id: workflow_id.to_string(),
                reason: e.to_string(),
            })?;
            events.push(event);
        }
        Ok(events)
    }

    async fn list_workflows(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".history.jsonl") {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
