// SPDX-License-Identifier: MIT OR Apache-2.0
//! Submit-to-outcome tracking.
//!
//! A job may finish before the WebSocket attaches, and a WebSocket may drop
//! silently mid-stream. The tracker therefore runs two cooperative tasks,
//! a history poller and a push-stream listener, sharing one
//! first-result-wins gate. Whichever produces a definitive outcome first
//! wins; the loser is aborted so no socket leaks.

use crate::client::BackendClient;
use crate::wire::{push_types, HistoryEntry};
use futures::StreamExt;
use rp_core::ProgressUpdate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tracker knobs.
#[derive(Clone, Copy, Debug)]
pub struct TrackerConfig {
    /// History poll cadence.
    pub poll_interval: Duration,
    /// Overall deadline for the whole track.
    pub timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Definitive outcome of tracking one prompt.
#[derive(Clone, Debug)]
pub enum TrackingOutcome {
    /// The backend recorded success; full history attached.
    Success {
        /// The history entry, outputs included.
        history: HistoryEntry,
    },
    /// The backend recorded (or pushed) a failure.
    Error {
        /// Error message, verbatim from the backend.
        message: String,
        /// History entry when the failure was seen via polling.
        history: Option<HistoryEntry>,
    },
    /// Execution was interrupted on the backend.
    Interrupted,
    /// The deadline elapsed without a definitive outcome.
    Unknown {
        /// What we know about why.
        message: String,
    },
}

impl TrackingOutcome {
    /// `true` only for [`TrackingOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, TrackingOutcome::Success { .. })
    }
}

/// Progress callback type; called from the listener task.
pub type ProgressFn = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Track `prompt_id` on `client` until a definitive outcome or the deadline.
pub async fn track(
    client: &BackendClient,
    prompt_id: &str,
    config: TrackerConfig,
    progress: Option<ProgressFn>,
) -> TrackingOutcome {
    info!(prompt_id, address = client.address(), "tracking started");
    // Capacity-one gate: the first sender wins, the second send fails into
    // the void and its task gets aborted right after.
    let (gate_tx, mut gate_rx) = mpsc::channel::<TrackingOutcome>(1);

    let poll_task = tokio::spawn(poll_history(
        client.clone(),
        prompt_id.to_string(),
        config.poll_interval,
        gate_tx.clone(),
    ));
    let watch_task = tokio::spawn(listen_push(
        client.clone(),
        prompt_id.to_string(),
        progress,
        gate_tx,
    ));

    let outcome = match tokio::time::timeout(config.timeout, gate_rx.recv()).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => TrackingOutcome::Unknown {
            message: "tracking tasks ended without a result".to_string(),
        },
        Err(_) => TrackingOutcome::Error {
            message: format!("tracking timed out after {:?}", config.timeout),
            history: None,
        },
    };

    poll_task.abort();
    watch_task.abort();
    debug!(prompt_id, success = outcome.is_success(), "tracking finished");
    outcome
}

/// Task P: poll history until the prompt shows up with a terminal status.
async fn poll_history(
    client: BackendClient,
    prompt_id: String,
    interval: Duration,
    gate: mpsc::Sender<TrackingOutcome>,
) {
    loop {
        match client.get_history(&prompt_id).await {
            Ok(Some(history)) => match history.status.status_str.as_str() {
                "success" => {
                    let _ = gate.try_send(TrackingOutcome::Success { history });
                    return;
                }
                "error" => {
                    let message = history.status.error_message();
                    let _ = gate.try_send(TrackingOutcome::Error {
                        message,
                        history: Some(history),
                    });
                    return;
                }
                _ => {}
            },
            Ok(None) => {}
            Err(e) => {
                // Transient; the next poll retries.
                warn!(prompt_id = %prompt_id, error = %e, "history poll failed");
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// Task W: follow the push stream; forward progress, resolve on terminal
/// messages. A dropped socket simply ends the task; polling covers it.
async fn listen_push(
    client: BackendClient,
    prompt_id: String,
    progress: Option<ProgressFn>,
    gate: mpsc::Sender<TrackingOutcome>,
) {
    let mut stream = match client.listen(Some(prompt_id.clone())).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(prompt_id = %prompt_id, error = %e, "websocket attach failed; polling only");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        match msg.kind.as_str() {
            push_types::EXECUTING => {
                if let (Some(node), Some(cb)) = (msg.executing_node(), progress.as_ref()) {
                    cb(ProgressUpdate {
                        prompt_id: prompt_id.clone(),
                        current_node: Some(node.to_string()),
                        value: None,
                        max: None,
                    });
                }
            }
            push_types::PROGRESS => {
                if let Some(cb) = progress.as_ref() {
                    cb(ProgressUpdate {
                        prompt_id: prompt_id.clone(),
                        current_node: None,
                        value: msg.data.get("value").and_then(|v| v.as_u64()),
                        max: msg.data.get("max").and_then(|v| v.as_u64()),
                    });
                }
            }
            push_types::EXECUTION_SUCCESS => {
                // The push frame has no outputs; fetch the full record.
                match client.get_history(&prompt_id).await {
                    Ok(Some(history)) => {
                        let _ = gate.try_send(TrackingOutcome::Success { history });
                        return;
                    }
                    Ok(None) | Err(_) => {
                        // History lagging behind the push; the poller will
                        // see it momentarily.
                    }
                }
            }
            push_types::EXECUTION_ERROR => {
                let _ = gate.try_send(TrackingOutcome::Error {
                    message: msg.exception_message(),
                    history: None,
                });
                return;
            }
            push_types::EXECUTION_INTERRUPTED => {
                let _ = gate.try_send(TrackingOutcome::Interrupted);
                return;
            }
            _ => {}
        }
    }
    debug!(prompt_id = %prompt_id, "push stream ended");
}
