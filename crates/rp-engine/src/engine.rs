// SPDX-License-Identifier: MIT OR Apache-2.0
//! The engine: workflow/activity registries, run lifecycle, signals,
//! queries, cancellation, and crash recovery.

use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::context::{CtxInner, ReplayState, WorkflowCtx};
use crate::history::{HistoryEvent, HistoryStore};
use crate::retry::ActivityOptions;
use crate::EngineError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow definitions
// ---------------------------------------------------------------------------

/// A registered workflow type: a deterministic async function over a
/// [`WorkflowCtx`].
#[async_trait]
pub trait WorkflowDef: Send + Sync {
    /// Registration name.
    fn type_name(&self) -> &str;

    /// The workflow body. Must route every side effect through `ctx`.
    async fn run(&self, ctx: WorkflowCtx, input: Value) -> Result<Value, EngineError>;
}

// ---------------------------------------------------------------------------
// Signal hub
// ---------------------------------------------------------------------------

/// Live signal queues for one run; waiters park on the notify and re-check
/// their queue after every delivery.
pub(crate) struct SignalHub {
    queues: StdMutex<HashMap<String, VecDeque<Value>>>,
    notify: Notify,
    /// Set once the driver has loaded its history snapshot; deliveries
    /// before that are already covered by the snapshot and are dropped.
    loaded: std::sync::atomic::AtomicBool,
}

impl SignalHub {
    fn new() -> Self {
        Self {
            queues: StdMutex::new(HashMap::new()),
            notify: Notify::new(),
            loaded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn try_pop(&self, name: &str) -> Option<Value> {
        self.queues
            .lock()
            .expect("hub lock")
            .get_mut(name)
            .and_then(|q| q.pop_front())
    }

    /// Register interest before checking queues; `notify_waiters` only wakes
    /// already-registered waiters.
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    fn push(&self, name: &str, payload: Value) {
        self.queues
            .lock()
            .expect("hub lock")
            .entry(name.to_string())
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
    }

    fn mark_loaded(&self) {
        self.loaded.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(std::sync::atomic::Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

type RunOutcome = Option<Result<Value, String>>;

struct RunEntry {
    parent: Option<String>,
    cancel_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<Value>,
    heartbeat_rx: watch::Receiver<Value>,
    result_rx: watch::Receiver<RunOutcome>,
    hub: Arc<SignalHub>,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn HistoryStore>,
    activities: RwLock<HashMap<String, Arc<dyn Activity>>>,
    workflow_defs: RwLock<HashMap<String, Arc<dyn WorkflowDef>>>,
    runs: Mutex<HashMap<String, RunEntry>>,
    /// Serialises signal delivery against snapshot loading so a signal is
    /// seen exactly once (snapshot or hub, never both).
    signal_gate: Mutex<()>,
}

/// Handle to a started workflow.
#[derive(Clone)]
pub struct WorkflowHandle {
    workflow_id: String,
    result_rx: watch::Receiver<RunOutcome>,
}

impl WorkflowHandle {
    /// The workflow id this handle tracks.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Await the terminal result.
    pub async fn result(&self) -> Result<Value, EngineError> {
        let mut rx = self.result_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome.map_err(EngineError::WorkflowFailed);
            }
            if rx.changed().await.is_err() {
                return Err(EngineError::WorkflowFailed(
                    "workflow driver dropped without a result".to_string(),
                ));
            }
        }
    }
}

/// The durable workflow engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine over a history store.
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                activities: RwLock::new(HashMap::new()),
                workflow_defs: RwLock::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
                signal_gate: Mutex::new(()),
            }),
        }
    }

    /// Register an activity implementation.
    pub fn register_activity(&self, activity: Arc<dyn Activity>) {
        self.inner
            .activities
            .write()
            .expect("activities lock")
            .insert(activity.name().to_string(), activity);
    }

    /// Register a workflow type.
    pub fn register_workflow(&self, def: Arc<dyn WorkflowDef>) {
        self.inner
            .workflow_defs
            .write()
            .expect("workflows lock")
            .insert(def.type_name().to_string(), def);
    }

    /// Start (or attach to) a workflow. Starting an id that is already live
    /// returns a handle to the live run; starting an id with a terminal
    /// history returns its recorded result through the handle.
    pub async fn start(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
    ) -> Result<WorkflowHandle, EngineError> {
        let result_rx = self
            .inner
            .clone()
            .ensure_run(workflow_type, workflow_id, input, None, None)
            .await?;
        Ok(WorkflowHandle {
            workflow_id: workflow_id.to_string(),
            result_rx,
        })
    }

    /// Deliver a signal. Arrival is durable: it is appended to history
    /// before any live delivery.
    pub async fn signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let _gate = self.inner.signal_gate.lock().await;
        self.inner
            .store
            .append(
                workflow_id,
                &HistoryEvent::SignalReceived {
                    name: name.to_string(),
                    payload: payload.clone(),
                },
            )
            .await?;
        let runs = self.inner.runs.lock().await;
        if let Some(entry) = runs.get(workflow_id) {
            if entry.hub.is_loaded() {
                entry.hub.push(name, payload);
            }
        }
        debug!(workflow_id, signal = name, "signal recorded");
        Ok(())
    }

    /// Read the latest state snapshot a workflow published. `None` when the
    /// workflow is not live.
    pub async fn query_state(&self, workflow_id: &str) -> Option<Value> {
        let runs = self.inner.runs.lock().await;
        runs.get(workflow_id).map(|e| e.state_rx.borrow().clone())
    }

    /// Latest heartbeat payload from any activity of the run.
    pub async fn last_heartbeat(&self, workflow_id: &str) -> Option<Value> {
        let runs = self.inner.runs.lock().await;
        runs.get(workflow_id)
            .map(|e| e.heartbeat_rx.borrow().clone())
    }

    /// Request cancellation; propagates to children.
    pub async fn cancel(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.inner
            .store
            .append(workflow_id, &HistoryEvent::CancelRequested)
            .await?;
        let runs = self.inner.runs.lock().await;
        let mut targets = vec![workflow_id.to_string()];
        // Children (and their children) cancel with the parent.
        loop {
            let mut grew = false;
            for (id, entry) in runs.iter() {
                if let Some(parent) = &entry.parent {
                    if targets.contains(parent) && !targets.contains(id) {
                        targets.push(id.clone());
                        grew = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }
        for id in targets {
            if let Some(entry) = runs.get(&id) {
                let _ = entry.cancel_tx.send(true);
                info!(workflow_id = %id, "cancellation requested");
            }
        }
        Ok(())
    }

    /// Re-drive every non-terminal, non-child workflow found in the store.
    /// Called once at worker startup; this is the crash-recovery path.
    pub async fn resume_all(&self) -> Result<Vec<WorkflowHandle>, EngineError> {
        let mut handles = Vec::new();
        for workflow_id in self.inner.store.list_workflows().await? {
            let events = self.inner.store.load(&workflow_id).await?;
            if events.iter().any(HistoryEvent::is_terminal) {
                continue;
            }
            let Some(HistoryEvent::WorkflowStarted {
                workflow_type,
                input,
                ..
            }) = events.first().cloned()
            else {
                continue;
            };
            // Child runs are re-driven by their parents' replay.
            if self.is_child_history(&workflow_id, &events) {
                continue;
            }
            {
                let runs = self.inner.runs.lock().await;
                if runs.contains_key(&workflow_id) {
                    continue;
                }
            }
            info!(workflow_id = %workflow_id, workflow_type = %workflow_type, "resuming workflow");
            let handle = self.start(&workflow_type, &workflow_id, input).await?;
            handles.push(handle);
        }
        Ok(handles)
    }

    fn is_child_history(&self, _workflow_id: &str, events: &[HistoryEvent]) -> bool {
        events.iter().any(|e| {
            matches!(
                e,
                HistoryEvent::MarkerRecorded { id, .. } if id == CHILD_MARKER
            )
        })
    }
}

/// Marker id recorded in a child's own history so `resume_all` can tell
/// children from roots.
const CHILD_MARKER: &str = "__parent";

impl EngineInner {
    /// Start a run if it is not already live; return its result receiver.
    async fn ensure_run(
        self: Arc<Self>,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
        parent: Option<String>,
        parent_cancel: Option<watch::Receiver<bool>>,
    ) -> Result<watch::Receiver<RunOutcome>, EngineError> {
        {
            let runs = self.runs.lock().await;
            if let Some(entry) = runs.get(workflow_id) {
                return Ok(entry.result_rx.clone());
            }
        }

        let def = self
            .workflow_defs
            .read()
            .expect("workflows lock")
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_type.to_string()))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(Value::Null);
        let (heartbeat_tx, heartbeat_rx) = watch::channel(Value::Null);
        let (result_tx, result_rx) = watch::channel(None);
        let hub = Arc::new(SignalHub::new());

        {
            let mut runs = self.runs.lock().await;
            if let Some(entry) = runs.get(workflow_id) {
                return Ok(entry.result_rx.clone());
            }
            runs.insert(
                workflow_id.to_string(),
                RunEntry {
                    parent: parent.clone(),
                    cancel_tx: cancel_tx.clone(),
                    state_rx,
                    heartbeat_rx,
                    result_rx: result_rx.clone(),
                    hub: hub.clone(),
                },
            );
        }

        // Parent cancellation flows into the child run.
        if let Some(mut parent_cancel) = parent_cancel {
            let cancel_tx = cancel_tx.clone();
            tokio::spawn(async move {
                loop {
                    if *parent_cancel.borrow() {
                        let _ = cancel_tx.send(true);
                        break;
                    }
                    if parent_cancel.changed().await.is_err() {
                        break;
                    }
                }
            });
        }

        let engine = self.clone();
        let workflow_id_owned = workflow_id.to_string();
        let is_child = parent.is_some();
        tokio::spawn(async move {
            let outcome = engine
                .clone()
                .drive(def, &workflow_id_owned, input, is_child, hub, cancel_rx, state_tx, heartbeat_tx)
                .await;
            let flattened = match &outcome {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(e.message()),
            };
            let _ = result_tx.send(Some(flattened));
        });

        Ok(result_rx)
    }

    /// Load-or-start the history, run the body, and record the terminal
    /// event.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        self: Arc<Self>,
        def: Arc<dyn WorkflowDef>,
        workflow_id: &str,
        input: Value,
        is_child: bool,
        hub: Arc<SignalHub>,
        cancel_rx: watch::Receiver<bool>,
        state_tx: watch::Sender<Value>,
        heartbeat_tx: watch::Sender<Value>,
    ) -> Result<Value, EngineError> {
        // Snapshot the history under the signal gate so concurrent signals
        // land either in the snapshot or in the hub, never both.
        let events = {
            let _gate = self.signal_gate.lock().await;
            let events = self.store.load(workflow_id).await?;
            hub.mark_loaded();
            events
        };

        // Terminal history: hand back the recorded outcome.
        for event in &events {
            match event {
                HistoryEvent::WorkflowCompleted { result } => return Ok(result.clone()),
                HistoryEvent::WorkflowFailed { error } => {
                    return Err(EngineError::WorkflowFailed(error.clone()))
                }
                _ => {}
            }
        }

        let (run_id, replaying) = match events.first() {
            Some(HistoryEvent::WorkflowStarted { run_id, .. }) => (run_id.clone(), true),
            _ => {
                let run_id = Uuid::new_v4().to_string();
                self.store
                    .append(
                        workflow_id,
                        &HistoryEvent::WorkflowStarted {
                            workflow_type: def.type_name().to_string(),
                            input: input.clone(),
                            run_id: run_id.clone(),
                            started_at: Utc::now(),
                        },
                    )
                    .await?;
                if is_child {
                    self.store
                        .append(
                            workflow_id,
                            &HistoryEvent::MarkerRecorded {
                                id: CHILD_MARKER.to_string(),
                                value: Value::Bool(true),
                            },
                        )
                        .await?;
                }
                (run_id, false)
            }
        };
        if replaying {
            debug!(workflow_id, events = events.len(), "replaying history");
        }

        let cancelled_in_history = events
            .iter()
            .any(|e| matches!(e, HistoryEvent::CancelRequested));
        if cancelled_in_history {
            let _ = self
                .runs
                .lock()
                .await
                .get(workflow_id)
                .map(|e| e.cancel_tx.send(true));
        }

        let replay = ReplayState::from_history(&events);
        let ctx = WorkflowCtx {
            inner: Arc::new(CtxInner {
                engine: self.clone(),
                workflow_id: workflow_id.to_string(),
                run_id,
                replay: StdMutex::new(replay),
                hub,
                cancel_rx,
                state_tx,
                heartbeat_tx,
            }),
        };

        let outcome = def.run(ctx, input).await;
        match &outcome {
            Ok(result) => {
                self.store
                    .append(
                        workflow_id,
                        &HistoryEvent::WorkflowCompleted {
                            result: result.clone(),
                        },
                    )
                    .await?;
                info!(workflow_id, "workflow completed");
            }
            Err(e) => {
                let message = e.message();
                self.store
                    .append(
                        workflow_id,
                        &HistoryEvent::WorkflowFailed {
                            error: message.clone(),
                        },
                    )
                    .await?;
                warn!(workflow_id, error = %message, "workflow failed");
            }
        }
        outcome
    }

    /// Run a child workflow to completion on behalf of a parent context.
    pub(crate) async fn run_child(
        self: Arc<Self>,
        workflow_type: &str,
        child_id: &str,
        input: Value,
        parent_id: &str,
        parent_cancel: watch::Receiver<bool>,
    ) -> Result<Value, EngineError> {
        let result_rx = self
            .ensure_run(
                workflow_type,
                child_id,
                input,
                Some(parent_id.to_string()),
                Some(parent_cancel),
            )
            .await?;
        let handle = WorkflowHandle {
            workflow_id: child_id.to_string(),
            result_rx,
        };
        handle.result().await
    }

    /// Execute one activity invocation: retries, per-attempt deadline,
    /// heartbeat watchdog, cancellation.
    pub(crate) async fn run_activity(
        &self,
        name: &str,
        input: Value,
        opts: ActivityOptions,
        cancel_rx: watch::Receiver<bool>,
        heartbeat_tx: watch::Sender<Value>,
    ) -> Result<Value, EngineError> {
        let activity = self
            .activities
            .read()
            .expect("activities lock")
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownActivity(name.to_string()))?;

        let max_attempts = opts.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if *cancel_rx.borrow() {
                return Err(EngineError::Cancelled);
            }
            if attempt > 1 {
                tokio::time::sleep(opts.retry.backoff(attempt)).await;
            }
            match run_attempt(
                activity.clone(),
                input.clone(),
                opts,
                attempt,
                cancel_rx.clone(),
                heartbeat_tx.clone(),
            )
            .await
            {
                AttemptOutcome::Ok(v) => return Ok(v),
                AttemptOutcome::Cancelled => return Err(EngineError::Cancelled),
                AttemptOutcome::Permanent(e) => {
                    return Err(EngineError::ActivityFailed {
                        activity: name.to_string(),
                        error: e,
                    })
                }
                AttemptOutcome::Transient(e) => {
                    warn!(activity = name, attempt, error = %e, "activity attempt failed");
                    last_error = e;
                }
            }
        }
        error!(activity = name, error = %last_error, "activity exhausted retries");
        Err(EngineError::ActivityFailed {
            activity: name.to_string(),
            error: last_error,
        })
    }
}

enum AttemptOutcome {
    Ok(Value),
    Transient(String),
    Permanent(String),
    Cancelled,
}

async fn run_attempt(
    activity: Arc<dyn Activity>,
    input: Value,
    opts: ActivityOptions,
    attempt: u32,
    mut cancel_rx: watch::Receiver<bool>,
    heartbeat_tx: watch::Sender<Value>,
) -> AttemptOutcome {
    let (hb_tx, mut hb_rx) = mpsc::unbounded_channel::<Value>();
    let actx = ActivityContext::new(hb_tx, cancel_rx.clone(), attempt);
    let fut = activity.execute(actx, input);
    tokio::pin!(fut);

    let started = tokio::time::Instant::now();
    let close_deadline = started + opts.start_to_close;
    let mut hb_deadline = opts.heartbeat_timeout.map(|t| started + t);
    let mut hb_open = true;

    loop {
        let hb_sleep = hb_deadline.unwrap_or_else(|| close_deadline + std::time::Duration::from_secs(1));
        tokio::select! {
            result = &mut fut => {
                return match result {
                    Ok(v) => AttemptOutcome::Ok(v),
                    Err(ActivityError::Transient(e)) => AttemptOutcome::Transient(e),
                    Err(ActivityError::Permanent(e)) => AttemptOutcome::Permanent(e),
                };
            }
            _ = tokio::time::sleep_until(close_deadline) => {
                return AttemptOutcome::Transient(format!(
                    "activity timed out after {:?}", opts.start_to_close
                ));
            }
            _ = tokio::time::sleep_until(hb_sleep), if hb_deadline.is_some() => {
                return AttemptOutcome::Transient(format!(
                    "heartbeat missed (window {:?})",
                    opts.heartbeat_timeout.unwrap_or_default()
                ));
            }
            beat = hb_rx.recv(), if hb_open => {
                match beat {
                    Some(details) => {
                        let _ = heartbeat_tx.send(details);
                        if let Some(window) = opts.heartbeat_timeout {
                            hb_deadline = Some(tokio::time::Instant::now() + window);
                        }
                    }
                    None => hb_open = false,
                }
            }
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    return AttemptOutcome::Cancelled;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::FnActivity;
    use crate::history::InMemoryHistoryStore;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct TwoStepWorkflow;

    #[async_trait]
    impl WorkflowDef for TwoStepWorkflow {
        fn type_name(&self) -> &str {
            "two_step"
        }

        async fn run(&self, ctx: WorkflowCtx, input: Value) -> Result<Value, EngineError> {
            let a = ctx
                .activity("first", "add_one", input, ActivityOptions::default())
                .await?;
            let b = ctx
                .activity("second", "add_one", a, ActivityOptions::default())
                .await?;
            Ok(b)
        }
    }

    fn add_one_counting(counter: Arc<AtomicU32>) -> Arc<dyn Activity> {
        Arc::new(FnActivity::new("add_one", move |_ctx, input: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let n = input.as_i64().ok_or_else(|| ActivityError::permanent("nan"))?;
                Ok(json!(n + 1))
            }
        }))
    }

    #[tokio::test]
    async fn workflow_runs_activities_in_sequence() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let engine = Engine::new(store);
        let calls = Arc::new(AtomicU32::new(0));
        engine.register_activity(add_one_counting(calls.clone()));
        engine.register_workflow(Arc::new(TwoStepWorkflow));

        let handle = engine.start("two_step", "wf-seq", json!(1)).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), json!(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn replay_skips_recorded_activities() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));

        // First engine: run to completion.
        {
            let engine = Engine::new(store.clone());
            engine.register_activity(add_one_counting(calls.clone()));
            engine.register_workflow(Arc::new(TwoStepWorkflow));
            let handle = engine.start("two_step", "wf-replay", json!(5)).await.unwrap();
            assert_eq!(handle.result().await.unwrap(), json!(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Second engine over the same store: terminal history short-circuits,
        // no activity re-executes.
        let engine = Engine::new(store);
        engine.register_activity(add_one_counting(calls.clone()));
        engine.register_workflow(Arc::new(TwoStepWorkflow));
        let handle = engine.start("two_step", "wf-replay", json!(5)).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), json!(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct FlakyWorkflow;

    #[async_trait]
    impl WorkflowDef for FlakyWorkflow {
        fn type_name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, ctx: WorkflowCtx, input: Value) -> Result<Value, EngineError> {
            let opts = ActivityOptions::new(
                Duration::from_secs(5),
                RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
            );
            ctx.activity("only", "flaky_act", input, opts).await
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let engine = Engine::new(store);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        engine.register_activity(Arc::new(FnActivity::new("flaky_act", move |_ctx, _input| {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ActivityError::transient("backend hiccup"))
                } else {
                    Ok(json!("ok"))
                }
            }
        })));
        engine.register_workflow(Arc::new(FlakyWorkflow));

        let handle = engine.start("flaky", "wf-flaky", json!({})).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_do_not_retry() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let engine = Engine::new(store);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        engine.register_activity(Arc::new(FnActivity::new("flaky_act", move |_ctx, _input| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(ActivityError::permanent("render exploded"))
            }
        })));
        engine.register_workflow(Arc::new(FlakyWorkflow));

        let handle = engine.start("flaky", "wf-perm", json!({})).await.unwrap();
        let err = handle.result().await.unwrap_err();
        assert!(err.to_string().contains("render exploded"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct WaitingWorkflow;

    #[async_trait]
    impl WorkflowDef for WaitingWorkflow {
        fn type_name(&self) -> &str {
            "waiting"
        }

        async fn run(&self, ctx: WorkflowCtx, _input: Value) -> Result<Value, EngineError> {
            let payload = ctx
                .wait_signal("decision", "go", Some(Duration::from_secs(5)))
                .await?;
            Ok(payload.unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn signal_wakes_waiting_workflow() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let engine = Engine::new(store);
        engine.register_workflow(Arc::new(WaitingWorkflow));

        let handle = engine.start("waiting", "wf-wait", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine
            .signal("wf-wait", "go", json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(handle.result().await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn wait_times_out_to_none() {
        struct ShortWait;
        #[async_trait]
        impl WorkflowDef for ShortWait {
            fn type_name(&self) -> &str {
                "short_wait"
            }
            async fn run(&self, ctx: WorkflowCtx, _input: Value) -> Result<Value, EngineError> {
                let payload = ctx
                    .wait_signal("w", "never", Some(Duration::from_millis(20)))
                    .await?;
                Ok(json!(payload.is_none()))
            }
        }
        let engine = Engine::new(Arc::new(InMemoryHistoryStore::new()));
        engine.register_workflow(Arc::new(ShortWait));
        let handle = engine.start("short_wait", "wf-to", json!({})).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn signal_before_wait_is_durable() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let engine = Engine::new(store.clone());
        engine.register_workflow(Arc::new(WaitingWorkflow));

        // Signal an id that has history but no live run yet.
        // (Simulates a decision landing while the worker is down.)
        store
            .append(
                "wf-early",
                &HistoryEvent::WorkflowStarted {
                    workflow_type: "waiting".into(),
                    input: json!({}),
                    run_id: "r-early".into(),
                    started_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        engine
            .signal("wf-early", "go", json!("early bird"))
            .await
            .unwrap();

        let handle = engine.start("waiting", "wf-early", json!({})).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), json!("early bird"));
    }

    struct ParentWorkflow;

    #[async_trait]
    impl WorkflowDef for ParentWorkflow {
        fn type_name(&self) -> &str {
            "parent"
        }

        async fn run(&self, ctx: WorkflowCtx, input: Value) -> Result<Value, EngineError> {
            ctx.child("step-a", "two_step", input, RetryPolicy::none())
                .await
        }
    }

    #[tokio::test]
    async fn child_workflow_result_flows_to_parent() {
        let engine = Engine::new(Arc::new(InMemoryHistoryStore::new()));
        let calls = Arc::new(AtomicU32::new(0));
        engine.register_activity(add_one_counting(calls));
        engine.register_workflow(Arc::new(TwoStepWorkflow));
        engine.register_workflow(Arc::new(ParentWorkflow));

        let handle = engine.start("parent", "wf-parent", json!(10)).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), json!(12));

        // Child id derivation is <parent>-<command id>.
        let ids = engine.inner.store.list_workflows().await.unwrap();
        assert!(ids.contains(&"wf-parent-step-a".to_string()));
    }

    #[tokio::test]
    async fn resume_all_redrives_unfinished_roots_only() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));

        // Write a started-but-unfinished root history by hand.
        store
            .append(
                "wf-crashed",
                &HistoryEvent::WorkflowStarted {
                    workflow_type: "two_step".into(),
                    input: json!(1),
                    run_id: "r-1".into(),
                    started_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        store
            .append(
                "wf-crashed",
                &HistoryEvent::ActivityCompleted {
                    id: "first".into(),
                    name: "add_one".into(),
                    result: json!(2),
                },
            )
            .await
            .unwrap();

        let engine = Engine::new(store);
        engine.register_activity(add_one_counting(calls.clone()));
        engine.register_workflow(Arc::new(TwoStepWorkflow));

        let handles = engine.resume_all().await.unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].result().await.unwrap(), json!(3));
        // Only the second activity ran live; the first replayed.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deterministic_uuid_is_stable() {
        struct UuidWorkflow;
        #[async_trait]
        impl WorkflowDef for UuidWorkflow {
            fn type_name(&self) -> &str {
                "uuid_wf"
            }
            async fn run(&self, ctx: WorkflowCtx, _input: Value) -> Result<Value, EngineError> {
                Ok(json!([ctx.uuid("client").to_string(), ctx.uuid("client").to_string()]))
            }
        }
        let engine = Engine::new(Arc::new(InMemoryHistoryStore::new()));
        engine.register_workflow(Arc::new(UuidWorkflow));
        let handle = engine.start("uuid_wf", "wf-uuid", json!({})).await.unwrap();
        let v = handle.result().await.unwrap();
        assert_eq!(v[0], v[1]);
    }

    #[tokio::test]
    async fn missed_heartbeats_abort_the_attempt() {
        struct SilentWorkflow;
        #[async_trait]
        impl WorkflowDef for SilentWorkflow {
            fn type_name(&self) -> &str {
                "silent"
            }
            async fn run(&self, ctx: WorkflowCtx, _input: Value) -> Result<Value, EngineError> {
                let opts = ActivityOptions::new(
                    Duration::from_secs(5),
                    RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
                )
                .with_heartbeat(Duration::from_millis(30));
                ctx.activity("only", "silent_act", json!({}), opts).await
            }
        }
        let engine = Engine::new(Arc::new(InMemoryHistoryStore::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        engine.register_activity(Arc::new(FnActivity::new("silent_act", move |_ctx, _input| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Never heartbeats; the watchdog must cut it off.
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(json!("too late"))
            }
        })));
        engine.register_workflow(Arc::new(SilentWorkflow));

        let handle = engine.start("silent", "wf-hb", json!({})).await.unwrap();
        let err = handle.result().await.unwrap_err();
        assert!(err.to_string().contains("heartbeat missed"));
        // Both attempts ran and were aborted.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn heartbeats_keep_a_slow_activity_alive() {
        struct BeatingWorkflow;
        #[async_trait]
        impl WorkflowDef for BeatingWorkflow {
            fn type_name(&self) -> &str {
                "beating"
            }
            async fn run(&self, ctx: WorkflowCtx, _input: Value) -> Result<Value, EngineError> {
                let opts = ActivityOptions::new(Duration::from_secs(5), RetryPolicy::none())
                    .with_heartbeat(Duration::from_millis(60));
                ctx.activity("only", "beating_act", json!({}), opts).await
            }
        }
        let engine = Engine::new(Arc::new(InMemoryHistoryStore::new()));
        engine.register_activity(Arc::new(FnActivity::new("beating_act", |ctx, _input| async move {
            for i in 0..6 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.heartbeat(json!({ "step": i }));
            }
            Ok(json!("done"))
        })));
        engine.register_workflow(Arc::new(BeatingWorkflow));

        let handle = engine.start("beating", "wf-beat", json!({})).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), json!("done"));
        // The last heartbeat payload is observable.
        assert_eq!(
            engine.last_heartbeat("wf-beat").await.unwrap()["step"],
            json!(5)
        );
    }

    #[tokio::test]
    async fn timer_fires_and_replays_as_fired() {
        struct TimedWorkflow;
        #[async_trait]
        impl WorkflowDef for TimedWorkflow {
            fn type_name(&self) -> &str {
                "timed"
            }
            async fn run(&self, ctx: WorkflowCtx, _input: Value) -> Result<Value, EngineError> {
                ctx.timer("nap", Duration::from_millis(30)).await?;
                Ok(json!("woke"))
            }
        }
        let store = Arc::new(InMemoryHistoryStore::new());
        {
            let engine = Engine::new(store.clone());
            engine.register_workflow(Arc::new(TimedWorkflow));
            let handle = engine.start("timed", "wf-timer", json!({})).await.unwrap();
            assert_eq!(handle.result().await.unwrap(), json!("woke"));
        }
        let events = store.load("wf-timer").await.unwrap();
        assert!(events.iter().any(|e| matches!(e, HistoryEvent::TimerScheduled { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, HistoryEvent::TimerFired { id } if id == "nap")));
    }

    #[tokio::test]
    async fn cancel_aborts_waiting_workflow() {
        let engine = Engine::new(Arc::new(InMemoryHistoryStore::new()));
        engine.register_workflow(Arc::new(WaitingWorkflow));
        let handle = engine.start("waiting", "wf-cancel", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.cancel("wf-cancel").await.unwrap();
        let err = handle.result().await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
