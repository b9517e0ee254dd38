// SPDX-License-Identifier: MIT OR Apache-2.0
//! The single-job workflow: one render on one backend, driven durably.
//!
//! Steps, each an activity with its own retry policy: pick a backend (unless
//! the enclosing chain pre-selected one), submit and track, enumerate output
//! files, download and index them, build the structured output. A worker
//! crash resumes mid-sequence without re-submitting; the submission is both
//! replay-recorded and intent-guarded.

use crate::activities::{
    SubmitTrackOut, BUILD_STRUCTURED_OUTPUT, DOWNLOAD_AND_PERSIST, DOWNLOAD_ONLY,
    EXTRACT_OUTPUT_FILES, SELECT_BACKEND, SUBMIT_AND_TRACK, UPDATE_JOB_STATUS,
};
use async_trait::async_trait;
use rp_core::{JobRequest, JobResult, JobStatus, LocalPreview, OutputFile, StructuredOutput};
use rp_engine::{ActivityOptions, EngineError, RetryPolicy, WorkflowCtx, WorkflowDef};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

/// Registered type name of the single-job workflow.
pub const JOB_WORKFLOW: &str = "render_job";

/// The workflow definition.
pub struct JobWorkflow;

fn opts(secs: u64, attempts: u32, initial_ms: u64, max_secs: u64) -> ActivityOptions {
    ActivityOptions::new(
        Duration::from_secs(secs),
        RetryPolicy::new(
            attempts,
            Duration::from_millis(initial_ms),
            Duration::from_secs(max_secs),
        ),
    )
}

#[async_trait]
impl WorkflowDef for JobWorkflow {
    fn type_name(&self) -> &str {
        JOB_WORKFLOW
    }

    async fn run(&self, ctx: WorkflowCtx, input: Value) -> Result<Value, EngineError> {
        let req: JobRequest = serde_json::from_value(input)
            .map_err(|e| EngineError::WorkflowFailed(format!("bad job request: {e}")))?;

        let publish = |status: &str, backend: &str, prompt_id: &str, error: Option<&str>| {
            ctx.publish_state(json!({
                "status": status,
                "backend": backend,
                "prompt_id": prompt_id,
                "error": error,
            }));
        };
        publish("initializing", "", "", None);

        // Deterministic per-execution client id; scopes the push stream.
        let client_id = ctx.uuid("client_id").to_string();

        // Step 1: backend selection.
        publish("selecting_backend", "", "", None);
        let backend = match &req.pre_selected_backend {
            Some(backend) => backend.clone(),
            None => {
                let picked = ctx
                    .activity(
                        "select-backend",
                        SELECT_BACKEND,
                        json!({ "strategy": req.strategy }),
                        opts(30, 3, 1_000, 10),
                    )
                    .await;
                match picked {
                    Ok(v) => v["backend"].as_str().unwrap_or_default().to_string(),
                    Err(e) => return self.fail(&ctx, &req, "", "", e).await,
                }
            }
        };

        // Step 2: submit + track, heartbeating progress.
        publish("executing", &backend, "", None);
        let exec = ctx
            .activity(
                "execute",
                SUBMIT_AND_TRACK,
                json!({
                    "backend": backend,
                    "workflow_json": req.workflow_json.clone(),
                    "client_id": client_id,
                    "intent_id": format!("{}:submit", ctx.workflow_id()),
                    "job_db_id": req.job_db_id.clone(),
                }),
                ActivityOptions::new(
                    Duration::from_secs(30 * 60),
                    RetryPolicy::new(2, Duration::from_secs(5), Duration::from_secs(30)),
                )
                .with_heartbeat(Duration::from_secs(10 * 60)),
            )
            .await;
        let exec: SubmitTrackOut = match exec {
            Ok(v) => serde_json::from_value(v)
                .map_err(|e| EngineError::WorkflowFailed(format!("bad tracker output: {e}")))?,
            Err(e) => return self.fail(&ctx, &req, &backend, "", e).await,
        };

        if exec.status != "completed" {
            let error = exec.error.unwrap_or_else(|| "render failed".to_string());
            if let Some(job_db_id) = &req.job_db_id {
                let _ = ctx
                    .activity(
                        "record-render-failure",
                        UPDATE_JOB_STATUS,
                        json!({ "job_db_id": job_db_id, "status": "failed", "error": error }),
                        opts(30, 3, 1_000, 10),
                    )
                    .await;
            }
            publish("failed", &backend, &exec.prompt_id, Some(&error));
            return Ok(serde_json::to_value(JobResult {
                status: JobStatus::Failed,
                prompt_id: exec.prompt_id,
                backend,
                output: None,
                local_preview: Vec::new(),
                error: Some(error),
            })
            .expect("job result serialises"));
        }

        // Step 3: flatten outputs.
        publish("processing_outputs", &backend, &exec.prompt_id, None);
        let files = ctx
            .activity(
                "extract-outputs",
                EXTRACT_OUTPUT_FILES,
                json!({ "history": exec.history }),
                opts(30, 2, 1_000, 5),
            )
            .await;
        let files: Vec<OutputFile> = match files {
            Ok(v) => serde_json::from_value(v["files"].clone())
                .map_err(|e| EngineError::WorkflowFailed(format!("bad output files: {e}")))?,
            Err(e) => return self.fail(&ctx, &req, &backend, &exec.prompt_id, e).await,
        };
        info!(workflow_id = %ctx.workflow_id(), count = files.len(), "outputs enumerated");

        // Step 4: download (indexed when a job row exists, ephemeral
        // otherwise).
        publish("downloading_files", &backend, &exec.prompt_id, None);
        let download = match &req.job_db_id {
            Some(job_db_id) => {
                ctx.activity(
                    "download",
                    DOWNLOAD_AND_PERSIST,
                    json!({ "job_db_id": job_db_id, "backend": backend, "files": files.clone() }),
                    opts(5 * 60, 3, 2_000, 10),
                )
                .await
            }
            None => {
                ctx.activity(
                    "download",
                    DOWNLOAD_ONLY,
                    json!({ "backend": backend, "files": files.clone() }),
                    opts(5 * 60, 3, 2_000, 10),
                )
                .await
            }
        };
        let local_preview: Vec<LocalPreview> = match download {
            Ok(v) => v["files"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .map(|f| LocalPreview {
                            local_filename: f["local_filename"].as_str().unwrap_or_default().into(),
                            local_path: f["local_path"].as_str().unwrap_or_default().into(),
                            original_filename: f["original_filename"]
                                .as_str()
                                .unwrap_or_default()
                                .into(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => return self.fail(&ctx, &req, &backend, &exec.prompt_id, e).await,
        };

        // Step 5: structured output from the registry descriptor.
        let output: Option<StructuredOutput> = match ctx
            .activity(
                "structured-output",
                BUILD_STRUCTURED_OUTPUT,
                json!({ "workflow_name": req.workflow_name, "files": files }),
                opts(30, 2, 1_000, 5),
            )
            .await
        {
            Ok(v) => serde_json::from_value(v["output"].clone()).unwrap_or(None),
            // Advisory; a failure here must not sink a finished render.
            Err(_) => None,
        };

        // Step 6: finalise.
        if let Some(job_db_id) = &req.job_db_id {
            let _ = ctx
                .activity(
                    "record-complete",
                    UPDATE_JOB_STATUS,
                    json!({ "job_db_id": job_db_id, "status": "completed" }),
                    opts(30, 3, 1_000, 10),
                )
                .await;
        }
        publish("completed", &backend, &exec.prompt_id, None);

        Ok(serde_json::to_value(JobResult {
            status: JobStatus::Completed,
            prompt_id: exec.prompt_id,
            backend,
            output,
            local_preview,
            error: None,
        })
        .expect("job result serialises"))
    }
}

impl JobWorkflow {
    /// Record the failure on the job row (when one exists) and return a
    /// failed [`JobResult`] as the workflow value. Engine-fatal errors
    /// (cancellation, nondeterminism) propagate instead.
    async fn fail(
        &self,
        ctx: &WorkflowCtx,
        req: &JobRequest,
        backend: &str,
        prompt_id: &str,
        e: EngineError,
    ) -> Result<Value, EngineError> {
        match e {
            EngineError::Cancelled | EngineError::Nondeterminism(_) | EngineError::Store(_) => {
                Err(e)
            }
            other => {
                let error = other.message();
                if let Some(job_db_id) = &req.job_db_id {
                    let _ = ctx
                        .activity(
                            "record-failure",
                            UPDATE_JOB_STATUS,
                            json!({ "job_db_id": job_db_id, "status": "failed", "error": error }),
                            opts(30, 3, 1_000, 10),
                        )
                        .await;
                }
                ctx.publish_state(json!({
                    "status": "failed",
                    "backend": backend,
                    "prompt_id": prompt_id,
                    "error": error,
                }));
                Ok(serde_json::to_value(JobResult {
                    status: JobStatus::Failed,
                    prompt_id: prompt_id.to_string(),
                    backend: backend.to_string(),
                    output: None,
                    local_preview: Vec::new(),
                    error: Some(error),
                })
                .expect("job result serialises"))
            }
        }
    }
}
