// SPDX-License-Identifier: MIT OR Apache-2.0
//! Activities: the only place a workflow touches the outside world.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

/// How an activity failed; decides whether the engine retries.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    /// Worth retrying with the same inputs (network, 5xx, store hiccup).
    #[error("{0}")]
    Transient(String),
    /// Retrying the same inputs fails the same way (validation, render
    /// execution error); surfaced to the workflow immediately.
    #[error("{0}")]
    Permanent(String),
}

impl ActivityError {
    /// Transient failure from any displayable error.
    pub fn transient(e: impl std::fmt::Display) -> Self {
        ActivityError::Transient(e.to_string())
    }

    /// Permanent failure from any displayable error.
    pub fn permanent(e: impl std::fmt::Display) -> Self {
        ActivityError::Permanent(e.to_string())
    }

    /// `true` for [`ActivityError::Transient`].
    pub fn is_transient(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }
}

/// Per-attempt context handed to an executing activity.
#[derive(Clone)]
pub struct ActivityContext {
    heartbeat_tx: mpsc::UnboundedSender<Value>,
    cancel_rx: watch::Receiver<bool>,
    attempt: u32,
}

impl ActivityContext {
    /// Build a context; the engine owns the receiving ends.
    pub(crate) fn new(
        heartbeat_tx: mpsc::UnboundedSender<Value>,
        cancel_rx: watch::Receiver<bool>,
        attempt: u32,
    ) -> Self {
        Self {
            heartbeat_tx,
            cancel_rx,
            attempt,
        }
    }

    /// Record liveness (and an optional progress payload) with the watchdog.
    pub fn heartbeat(&self, details: Value) {
        let _ = self.heartbeat_tx.send(details);
    }

    /// `true` once cancellation has been requested for the owning workflow.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// A named unit of side-effectful work.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Registration name; workflows invoke by this name.
    fn name(&self) -> &str;

    /// Execute one attempt.
    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError>;
}

/// Adapter turning an async closure into an [`Activity`]; used heavily in
/// tests and by the orchestrator's small glue activities.
pub struct FnActivity<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnActivity<F>
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ActivityError>> + Send,
{
    /// Wrap `func` under `name`.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ActivityError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        (self.func)(ctx, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fn_activity_executes_closure() {
        let act = FnActivity::new("double", |_ctx, input: Value| async move {
            let n = input.as_i64().ok_or_else(|| ActivityError::permanent("not a number"))?;
            Ok(json!(n * 2))
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_ctx_tx, cancel_rx) = watch::channel(false);
        let ctx = ActivityContext::new(tx, cancel_rx, 1);
        assert_eq!(act.name(), "double");
        assert_eq!(act.execute(ctx.clone(), json!(21)).await.unwrap(), json!(42));
        let err = act.execute(ctx, json!("x")).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
