// SPDX-License-Identifier: MIT OR Apache-2.0
//! The workflow-side context: every suspension a workflow is allowed.
//!
//! All methods that suspend take a **command id**, a stable string chosen by
//! the workflow (`"select_backend"`, `"step-b/transfer"`, ...). The id is the
//! replay key: a recorded outcome under the same id short-circuits, so the
//! workflow function can be re-run from the top after a crash and arrive at
//! the live frontier without repeating side effects. Ids must be unique per
//! run; reuse is reported as nondeterminism.

use crate::activity::ActivityError;
use crate::engine::{EngineInner, SignalHub};
use crate::history::HistoryEvent;
use crate::retry::{ActivityOptions, RetryPolicy};
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

/// Outcomes reconstructed from a history snapshot, keyed by command id.
#[derive(Default)]
pub(crate) struct ReplayState {
    pub(crate) activities: HashMap<String, Result<Value, String>>,
    pub(crate) timers_scheduled: HashMap<String, DateTime<Utc>>,
    pub(crate) timers_fired: HashSet<String>,
    pub(crate) waits_scheduled: HashMap<String, Option<DateTime<Utc>>>,
    pub(crate) waits_resolved: HashMap<String, Option<Value>>,
    pub(crate) markers: HashMap<String, Value>,
    pub(crate) children: HashMap<String, Result<Value, String>>,
    /// Signals from the snapshot not consumed by a recorded wait.
    pub(crate) pending_signals: HashMap<String, VecDeque<Value>>,
    /// Ids used live in this run; duplicates are nondeterminism.
    pub(crate) used_ids: HashSet<String>,
}

impl ReplayState {
    /// Fold a history snapshot into replayable outcomes.
    pub(crate) fn from_history(events: &[HistoryEvent]) -> Self {
        let mut state = ReplayState::default();
        for event in events {
            match event {
                HistoryEvent::ActivityCompleted { id, result, .. } => {
                    state.activities.insert(id.clone(), Ok(result.clone()));
                }
                HistoryEvent::ActivityFailed { id, error, .. } => {
                    state.activities.insert(id.clone(), Err(error.clone()));
                }
                HistoryEvent::TimerScheduled { id, fire_at } => {
                    state.timers_scheduled.insert(id.clone(), *fire_at);
                }
                HistoryEvent::TimerFired { id } => {
                    state.timers_fired.insert(id.clone());
                }
                HistoryEvent::SignalReceived { name, payload } => {
                    state
                        .pending_signals
                        .entry(name.clone())
                        .or_default()
                        .push_back(payload.clone());
                }
                HistoryEvent::WaitScheduled { id, deadline } => {
                    state.waits_scheduled.insert(id.clone(), *deadline);
                }
                HistoryEvent::WaitResolved { id, name, payload } => {
                    if payload.is_some() {
                        if let Some(queue) = state.pending_signals.get_mut(name) {
                            queue.pop_front();
                        }
                    }
                    state.waits_resolved.insert(id.clone(), payload.clone());
                }
                HistoryEvent::MarkerRecorded { id, value } => {
                    state.markers.insert(id.clone(), value.clone());
                }
                HistoryEvent::ChildCompleted { id, result } => {
                    state.children.insert(id.clone(), Ok(result.clone()));
                }
                HistoryEvent::ChildFailed { id, error } => {
                    state.children.insert(id.clone(), Err(error.clone()));
                }
                _ => {}
            }
        }
        state
    }
}

/// Handle to one running workflow, passed to (and cloned inside) the
/// workflow body.
#[derive(Clone)]
pub struct WorkflowCtx {
    pub(crate) inner: Arc<CtxInner>,
}

pub(crate) struct CtxInner {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) workflow_id: String,
    pub(crate) run_id: String,
    pub(crate) replay: Mutex<ReplayState>,
    pub(crate) hub: Arc<SignalHub>,
    pub(crate) cancel_rx: watch::Receiver<bool>,
    pub(crate) state_tx: watch::Sender<Value>,
    pub(crate) heartbeat_tx: watch::Sender<Value>,
}

impl WorkflowCtx {
    /// The stable workflow id.
    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    /// The run id recorded at first start; stable across replays.
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel_rx.borrow()
    }

    /// Deterministic UUID: v5 over `run_id:id`. No history entry needed;
    /// the derivation replays identically.
    pub fn uuid(&self, id: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{}:{}", self.inner.run_id, id).as_bytes(),
        )
    }

    /// Deterministic clock reading, recorded as a marker.
    pub async fn now(&self, id: &str) -> Result<DateTime<Utc>, EngineError> {
        if let Some(v) = self.recorded_marker(id) {
            let ts: DateTime<Utc> = serde_json::from_value(v)
                .map_err(|e| EngineError::Nondeterminism(format!("marker '{id}': {e}")))?;
            return Ok(ts);
        }
        self.claim_id(id)?;
        let ts = Utc::now();
        self.append(HistoryEvent::MarkerRecorded {
            id: id.to_string(),
            value: serde_json::to_value(ts).expect("timestamp serialises"),
        })
        .await?;
        Ok(ts)
    }

    /// Deterministic random value, recorded as a marker.
    pub async fn random_u64(&self, id: &str) -> Result<u64, EngineError> {
        if let Some(v) = self.recorded_marker(id) {
            return v
                .as_u64()
                .ok_or_else(|| EngineError::Nondeterminism(format!("marker '{id}' not a u64")));
        }
        self.claim_id(id)?;
        let bytes = Uuid::new_v4();
        let n = u64::from_le_bytes(bytes.as_bytes()[..8].try_into().expect("8 bytes"));
        self.append(HistoryEvent::MarkerRecorded {
            id: id.to_string(),
            value: Value::from(n),
        })
        .await?;
        Ok(n)
    }

    /// Publish a state snapshot for side-effect-free queries.
    pub fn publish_state(&self, state: Value) {
        let _ = self.inner.state_tx.send(state);
    }

    /// Latest heartbeat payload forwarded by any activity of this run.
    pub fn last_heartbeat(&self) -> Value {
        self.inner.heartbeat_tx.borrow().clone()
    }

    // -----------------------------------------------------------------------
    // Activities
    // -----------------------------------------------------------------------

    /// Invoke a registered activity under the given command id.
    pub async fn activity(
        &self,
        id: &str,
        name: &str,
        input: Value,
        opts: ActivityOptions,
    ) -> Result<Value, EngineError> {
        if let Some(outcome) = {
            let replay = self.inner.replay.lock().expect("replay lock");
            replay.activities.get(id).cloned()
        } {
            return outcome.map_err(|error| EngineError::ActivityFailed {
                activity: name.to_string(),
                error,
            });
        }
        self.claim_id(id)?;
        self.check_cancelled()?;

        let outcome = self
            .inner
            .engine
            .run_activity(
                name,
                input,
                opts,
                self.inner.cancel_rx.clone(),
                self.inner.heartbeat_tx.clone(),
            )
            .await;

        match outcome {
            Ok(result) => {
                self.append(HistoryEvent::ActivityCompleted {
                    id: id.to_string(),
                    name: name.to_string(),
                    result: result.clone(),
                })
                .await?;
                Ok(result)
            }
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => {
                let error = e.message();
                self.append(HistoryEvent::ActivityFailed {
                    id: id.to_string(),
                    name: name.to_string(),
                    error: error.clone(),
                })
                .await?;
                Err(EngineError::ActivityFailed {
                    activity: name.to_string(),
                    error,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers and waits
    // -----------------------------------------------------------------------

    /// Durable sleep. The fire time is recorded on first reach, so a restart
    /// resumes the remaining wait rather than starting over.
    pub async fn timer(&self, id: &str, duration: std::time::Duration) -> Result<(), EngineError> {
        let (fired, scheduled) = {
            let replay = self.inner.replay.lock().expect("replay lock");
            (
                replay.timers_fired.contains(id),
                replay.timers_scheduled.get(id).copied(),
            )
        };
        if fired {
            return Ok(());
        }
        let fire_at = match scheduled {
            Some(at) => at,
            None => {
                self.claim_id(id)?;
                let at = Utc::now()
                    + chrono::Duration::from_std(duration)
                        .unwrap_or_else(|_| chrono::Duration::try_seconds(0).expect("zero"));
                self.append(HistoryEvent::TimerScheduled {
                    id: id.to_string(),
                    fire_at: at,
                })
                .await?;
                at
            }
        };
        self.sleep_until(fire_at).await?;
        self.append(HistoryEvent::TimerFired { id: id.to_string() })
            .await?;
        Ok(())
    }

    /// Wait for the next signal with the given name, up to `timeout`.
    /// Returns `None` on deadline expiry. Consumption order per name is FIFO
    /// and durable.
    pub async fn wait_signal(
        &self,
        id: &str,
        name: &str,
        timeout: Option<std::time::Duration>,
    ) -> Result<Option<Value>, EngineError> {
        let (resolved, scheduled) = {
            let replay = self.inner.replay.lock().expect("replay lock");
            (
                replay.waits_resolved.get(id).cloned(),
                replay.waits_scheduled.get(id).cloned(),
            )
        };
        if let Some(outcome) = resolved {
            return Ok(outcome);
        }

        let deadline = match scheduled {
            Some(deadline) => deadline,
            None => {
                self.claim_id(id)?;
                let deadline = timeout.and_then(|t| {
                    chrono::Duration::from_std(t)
                        .ok()
                        .map(|d| Utc::now() + d)
                });
                self.append(HistoryEvent::WaitScheduled {
                    id: id.to_string(),
                    deadline,
                })
                .await?;
                deadline
            }
        };

        loop {
            self.check_cancelled()?;
            // Register interest before checking the queues so a push between
            // the check and the await still wakes us; `enable` registers the
            // waiter without polling.
            let notified = self.inner.hub.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Snapshot leftovers first (chronologically older), then the hub.
            let from_snapshot = {
                let mut replay = self.inner.replay.lock().expect("replay lock");
                replay
                    .pending_signals
                    .get_mut(name)
                    .and_then(|q| q.pop_front())
            };
            let next = match from_snapshot {
                Some(v) => Some(v),
                None => self.inner.hub.try_pop(name),
            };
            if let Some(payload) = next {
                self.append(HistoryEvent::WaitResolved {
                    id: id.to_string(),
                    name: name.to_string(),
                    payload: Some(payload.clone()),
                })
                .await?;
                return Ok(Some(payload));
            }

            let mut cancel_rx = self.inner.cancel_rx.clone();
            match deadline {
                Some(deadline) => {
                    let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = cancel_rx.changed() => {}
                        _ = tokio::time::sleep(remaining) => {
                            self.append(HistoryEvent::WaitResolved {
                                id: id.to_string(),
                                name: name.to_string(),
                                payload: None,
                            })
                            .await?;
                            return Ok(None);
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = cancel_rx.changed() => {}
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Child workflows
    // -----------------------------------------------------------------------

    /// Run a child workflow to completion. The child's workflow id is
    /// `<parent>-<id>`, stable across retries and replays.
    pub async fn child(
        &self,
        id: &str,
        workflow_type: &str,
        input: Value,
        retry: RetryPolicy,
    ) -> Result<Value, EngineError> {
        if let Some(outcome) = {
            let replay = self.inner.replay.lock().expect("replay lock");
            replay.children.get(id).cloned()
        } {
            return outcome.map_err(|error| EngineError::ChildFailed {
                child: id.to_string(),
                error,
            });
        }
        self.claim_id(id)?;

        let base = format!("{}-{}", self.inner.workflow_id, id);
        let mut last_error = String::new();
        for attempt in 1..=retry.max_attempts.max(1) {
            self.check_cancelled()?;
            let child_id = if attempt == 1 {
                base.clone()
            } else {
                format!("{base}--r{attempt}")
            };
            let result = self
                .inner
                .engine
                .clone()
                .run_child(
                    workflow_type,
                    &child_id,
                    input.clone(),
                    &self.inner.workflow_id,
                    self.inner.cancel_rx.clone(),
                )
                .await;
            match result {
                Ok(value) => {
                    self.append(HistoryEvent::ChildCompleted {
                        id: id.to_string(),
                        result: value.clone(),
                    })
                    .await?;
                    return Ok(value);
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    last_error = e.message();
                    if attempt < retry.max_attempts {
                        tokio::time::sleep(retry.backoff(attempt + 1)).await;
                    }
                }
            }
        }
        self.append(HistoryEvent::ChildFailed {
            id: id.to_string(),
            error: last_error.clone(),
        })
        .await?;
        Err(EngineError::ChildFailed {
            child: id.to_string(),
            error: last_error,
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn recorded_marker(&self, id: &str) -> Option<Value> {
        self.inner
            .replay
            .lock()
            .expect("replay lock")
            .markers
            .get(id)
            .cloned()
    }

    fn claim_id(&self, id: &str) -> Result<(), EngineError> {
        let mut replay = self.inner.replay.lock().expect("replay lock");
        if !replay.used_ids.insert(id.to_string()) {
            return Err(EngineError::Nondeterminism(format!(
                "command id '{id}' used twice in workflow '{}'",
                self.inner.workflow_id
            )));
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    async fn sleep_until(&self, fire_at: DateTime<Utc>) -> Result<(), EngineError> {
        let mut cancel_rx = self.inner.cancel_rx.clone();
        loop {
            let remaining = (fire_at - Utc::now()).to_std().unwrap_or_default();
            if remaining.is_zero() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return Ok(()),
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        return Err(EngineError::Cancelled);
                    }
                }
            }
        }
    }

    async fn append(&self, event: HistoryEvent) -> Result<(), EngineError> {
        self.inner
            .engine
            .store
            .append(&self.inner.workflow_id, &event)
            .await?;
        Ok(())
    }

    /// Convert an activity-layer error into the engine error space. Used by
    /// workflow bodies that call helper code returning [`ActivityError`].
    pub fn activity_error(name: &str, e: ActivityError) -> EngineError {
        EngineError::ActivityFailed {
            activity: name.to_string(),
            error: e.to_string(),
        }
    }
}
