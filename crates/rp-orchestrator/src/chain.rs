// SPDX-License-Identifier: MIT OR Apache-2.0
//! The chain executor workflow.
//!
//! Runs an [`ExecutionPlan`] level by level: steps within a level execute
//! concurrently, levels join before the next starts, so a step only ever
//! reads results from strictly earlier levels. Every engine command id is
//! prefixed with the step id (and the regeneration attempt), which keeps
//! replay stable no matter how parallel steps interleave.

use crate::activities::{
    APPLY_WORKFLOW_PARAMETERS, CANCEL_APPROVAL_REQUEST, CREATE_APPROVAL_REQUEST,
    CREATE_CHAIN_RECORD, CREATE_JOB_RECORD, EVALUATE_CONDITION, GET_JOB_ARTIFACTS, RESOLVE_TEMPLATES,
    SELECT_BACKEND, TRANSFER_ARTIFACTS, UPDATE_CHAIN_STATUS, UPDATE_JOB_STATUS,
};
use crate::job::JOB_WORKFLOW;
use async_trait::async_trait;
use futures::future::join_all;
use rp_chain::planner::{ExecutionNode, ExecutionPlan};
use rp_core::{
    approval_signal_name, ApprovalDecision, ApprovalPolicy, ChainRunResult, JobRequest, JobResult,
    JobStatus, OnRejected, SelectionStrategy, StepResult, StepStatus, TimeoutAction,
};
use rp_engine::{ActivityOptions, EngineError, RetryPolicy, WorkflowCtx, WorkflowDef};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Registered type name of the chain executor.
pub const CHAIN_WORKFLOW: &str = "chain_executor";

/// Input to the chain executor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainRequest {
    /// The validated, level-sorted plan.
    pub plan: ExecutionPlan,
    /// Extra parameters merged into every level-0 step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_parameters: Option<Map<String, Value>>,
}

/// The workflow definition.
pub struct ChainWorkflow;

/// Parameter keys that drive orchestration rather than the template.
const RESERVED_KEYS: &[&str] = &["requires_approval", "approval"];

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

/// Engine-fatal errors propagate; everything else becomes the step's
/// failure message.
fn step_error(e: EngineError) -> Result<String, EngineError> {
    match e {
        EngineError::Cancelled | EngineError::Nondeterminism(_) | EngineError::Store(_) => Err(e),
        other => Ok(other.message()),
    }
}

#[async_trait]
impl WorkflowDef for ChainWorkflow {
    fn type_name(&self) -> &str {
        CHAIN_WORKFLOW
    }

    async fn run(&self, ctx: WorkflowCtx, input: Value) -> Result<Value, EngineError> {
        let req: ChainRequest = serde_json::from_value(input)
            .map_err(|e| EngineError::WorkflowFailed(format!("bad chain request: {e}")))?;
        let plan = req.plan;
        info!(
            chain = %plan.chain_name,
            levels = plan.total_levels(),
            steps = plan.nodes.len(),
            "chain execution starting"
        );

        let chain_db_id = ctx
            .activity(
                "create-chain",
                CREATE_CHAIN_RECORD,
                json!({
                    "name": plan.chain_name,
                    "description": plan.description,
                    "engine_workflow_id": ctx.workflow_id(),
                    "engine_run_id": ctx.run_id(),
                    "definition": serde_json::to_value(&plan)
                        .map_err(|e| EngineError::WorkflowFailed(e.to_string()))?,
                }),
                opts(30, 3, 1_000, 10),
            )
            .await?["chain_db_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let mut step_results: BTreeMap<String, StepResult> = BTreeMap::new();
        let mut chain_error: Option<String> = None;

        for (level, step_ids) in plan.levels.iter().enumerate() {
            self.publish(&ctx, &format!("executing_level_{level}"), level, &step_results);
            ctx.activity(
                &format!("level{level}-status"),
                UPDATE_CHAIN_STATUS,
                json!({
                    "chain_db_id": chain_db_id,
                    "status": format!("executing_level_{level}"),
                    "current_level": level,
                }),
                opts(30, 3, 1_000, 10),
            )
            .await?;

            // All steps of the level in parallel; results land keyed by
            // step id, so completion order is irrelevant.
            let futures: Vec<_> = step_ids
                .iter()
                .filter_map(|step_id| plan.node(step_id))
                .map(|node| {
                    let initial = (level == 0)
                        .then(|| req.initial_parameters.clone())
                        .flatten();
                    self.execute_step(&ctx, node, &chain_db_id, &step_results, initial)
                })
                .collect();
            let results = join_all(futures).await;

            for result in results {
                let result = result?;
                if result.status == StepStatus::Failed && chain_error.is_none() {
                    chain_error = Some(
                        result
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("step '{}' failed", result.step_id)),
                    );
                }
                step_results.insert(result.step_id.clone(), result);
            }

            // A failed level stops the chain; completed steps keep their
            // results.
            if chain_error.is_some() {
                break;
            }
        }

        let (status, error) = match chain_error {
            None => ("completed", None),
            Some(e) => ("failed", Some(e)),
        };
        ctx.activity(
            "finalize-chain",
            UPDATE_CHAIN_STATUS,
            json!({ "chain_db_id": chain_db_id, "status": status, "error": error }),
            opts(30, 3, 1_000, 10),
        )
        .await?;
        self.publish(&ctx, status, plan.total_levels(), &step_results);
        info!(chain = %plan.chain_name, status, "chain execution finished");

        Ok(serde_json::to_value(ChainRunResult {
            chain_name: plan.chain_name,
            status: status.to_string(),
            step_results,
            error,
        })
        .expect("chain result serialises"))
    }
}

impl ChainWorkflow {
    fn publish(
        &self,
        ctx: &WorkflowCtx,
        status: &str,
        level: usize,
        step_results: &BTreeMap<String, StepResult>,
    ) {
        let statuses: BTreeMap<&String, StepStatus> =
            step_results.iter().map(|(k, v)| (k, v.status)).collect();
        ctx.publish_state(json!({
            "status": status,
            "current_level": level,
            "completed_steps": step_results.len(),
            "step_statuses": statuses,
        }));
    }

    /// Execute one step: condition, then the regeneration loop (resolve →
    /// bind → select → transfer deps → job row → child job workflow →
    /// approval gate).
    async fn execute_step(
        &self,
        ctx: &WorkflowCtx,
        node: &ExecutionNode,
        chain_db_id: &str,
        prior_results: &BTreeMap<String, StepResult>,
        initial_parameters: Option<Map<String, Value>>,
    ) -> Result<StepResult, EngineError> {
        let step_id = &node.step_id;
        let fail = |error: String| StepResult {
            step_id: step_id.clone(),
            workflow: node.workflow.clone(),
            status: StepStatus::Failed,
            output: None,
            parameters: None,
            backend: None,
            job_db_id: None,
            error: Some(error),
        };
        let skipped = || StepResult {
            step_id: step_id.clone(),
            workflow: node.workflow.clone(),
            status: StepStatus::Skipped,
            output: None,
            parameters: None,
            backend: None,
            job_db_id: None,
            error: None,
        };

        // Condition gate.
        if let Some(condition) = &node.condition {
            let verdict = ctx
                .activity(
                    &format!("{step_id}/condition"),
                    EVALUATE_CONDITION,
                    json!({ "condition": condition, "step_results": prior_results }),
                    opts(30, 1, 0, 0),
                )
                .await;
            match verdict {
                Ok(v) if v["result"].as_bool() == Some(true) => {}
                Ok(_) => {
                    info!(step = %step_id, "condition false; step skipped");
                    return Ok(skipped());
                }
                Err(e) => return Ok(fail(step_error(e)?)),
            }
        }

        let requires_approval = node
            .parameters
            .get("requires_approval")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let policy: ApprovalPolicy = node
            .parameters
            .get("approval")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default()
            .unwrap_or_default();

        let mut regeneration: Option<BTreeMap<String, Value>> = None;
        let mut attempt: u32 = 0;

        loop {
            let try_id = |op: &str| format!("{step_id}/t{attempt}/{op}");

            // Merge: step parameters ← level-0 initial ← regeneration edits.
            let mut merged = node.parameters.clone();
            if let Some(initial) = &initial_parameters {
                for (k, v) in initial {
                    merged.insert(k.clone(), v.clone());
                }
            }
            if let Some(edits) = &regeneration {
                for (k, v) in edits {
                    merged.insert(k.clone(), v.clone());
                }
            }

            // Resolve {{ ... }} references against prior levels.
            let resolved = match ctx
                .activity(
                    &try_id("resolve"),
                    RESOLVE_TEMPLATES,
                    json!({ "parameters": merged, "step_results": prior_results }),
                    opts(30, 1, 0, 0),
                )
                .await
            {
                Ok(v) => v["parameters"].clone(),
                Err(e) => return Ok(fail(step_error(e)?)),
            };

            // Bind the override-shaped subset into the template. Reserved
            // keys and chain-level values (no node prefix) stay out of the
            // document and travel on the step result instead.
            let bind_params: Map<String, Value> = resolved
                .as_object()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()) && k.contains('.'))
                .collect();
            let workflow_json = match ctx
                .activity(
                    &try_id("bind"),
                    APPLY_WORKFLOW_PARAMETERS,
                    json!({ "workflow_name": node.workflow, "parameters": bind_params }),
                    opts(30, 2, 1_000, 5),
                )
                .await
            {
                Ok(v) => v["workflow_json"].clone(),
                Err(e) => return Ok(fail(step_error(e)?)),
            };

            // Pre-select the target backend so dependency artifacts land on
            // the machine that will consume them.
            let target = match ctx
                .activity(
                    &try_id("select"),
                    SELECT_BACKEND,
                    json!({ "strategy": SelectionStrategy::LeastLoaded }),
                    opts(30, 3, 1_000, 10),
                )
                .await
            {
                Ok(v) => v["backend"].as_str().unwrap_or_default().to_string(),
                Err(e) => return Ok(fail(step_error(e)?)),
            };

            // Move upstream artifacts onto the target backend.
            for dep in &node.dependencies {
                let Some(dep_job_id) = prior_results
                    .get(dep)
                    .and_then(|r| r.job_db_id.clone())
                else {
                    warn!(step = %step_id, dep = %dep, "dependency has no job row; skipping transfer");
                    continue;
                };
                let artifact_ids: Vec<String> = match ctx
                    .activity(
                        &try_id(&format!("artifacts/{dep}")),
                        GET_JOB_ARTIFACTS,
                        json!({ "job_db_id": dep_job_id, "latest_only": true }),
                        opts(30, 3, 1_000, 10),
                    )
                    .await
                {
                    Ok(v) => serde_json::from_value(v["artifact_ids"].clone()).unwrap_or_default(),
                    Err(e) => return Ok(fail(step_error(e)?)),
                };
                if artifact_ids.is_empty() {
                    continue;
                }
                if let Err(e) = ctx
                    .activity(
                        &try_id(&format!("transfer/{dep}")),
                        TRANSFER_ARTIFACTS,
                        json!({
                            "source_job_id": dep_job_id,
                            "target_backend": target,
                            "artifact_ids": artifact_ids,
                        }),
                        opts(5 * 60, 3, 2_000, 10),
                    )
                    .await
                {
                    return Ok(fail(step_error(e)?));
                }
            }

            // Job row (found again, not duplicated, on regeneration).
            let child_cmd = if attempt == 0 {
                step_id.clone()
            } else {
                format!("{step_id}-r{attempt}")
            };
            let child_workflow_id = format!("{}-{}", ctx.workflow_id(), child_cmd);
            let job_db_id = match ctx
                .activity(
                    &try_id("job-record"),
                    CREATE_JOB_RECORD,
                    json!({
                        "chain_id": chain_db_id,
                        "step_id": step_id,
                        "workflow_name": node.workflow,
                        "backend": target,
                        "engine_workflow_id": child_workflow_id,
                        "definition": workflow_json,
                        "parameters": resolved,
                    }),
                    opts(30, 3, 1_000, 10),
                )
                .await
            {
                Ok(v) => v["job_db_id"].as_str().unwrap_or_default().to_string(),
                Err(e) => return Ok(fail(step_error(e)?)),
            };

            // The render itself, as a child workflow.
            let child = ctx
                .child(
                    &child_cmd,
                    JOB_WORKFLOW,
                    serde_json::to_value(JobRequest {
                        workflow_json: workflow_json.clone(),
                        strategy: SelectionStrategy::LeastLoaded,
                        workflow_name: Some(node.workflow.clone()),
                        pre_selected_backend: Some(target.clone()),
                        job_db_id: Some(job_db_id.clone()),
                    })
                    .expect("job request serialises"),
                    RetryPolicy::new(2, Duration::from_secs(10), Duration::from_secs(60)),
                )
                .await;
            let job_result: JobResult = match child {
                Ok(v) => serde_json::from_value(v)
                    .map_err(|e| EngineError::WorkflowFailed(format!("bad child result: {e}")))?,
                Err(e) => {
                    let error = step_error(e)?;
                    let _ = ctx
                        .activity(
                            &try_id("record-child-failure"),
                            UPDATE_JOB_STATUS,
                            json!({ "job_db_id": job_db_id, "status": "failed", "error": error }),
                            opts(30, 3, 1_000, 10),
                        )
                        .await;
                    return Ok(fail(error));
                }
            };
            if job_result.status != JobStatus::Completed {
                return Ok(fail(
                    job_result
                        .error
                        .unwrap_or_else(|| "render job failed".to_string()),
                ));
            }

            // Approval gate.
            if requires_approval {
                match self
                    .approval_gate(ctx, node, chain_db_id, &job_db_id, &resolved, &target, policy, attempt)
                    .await?
                {
                    GateOutcome::Approved => {}
                    GateOutcome::Regenerate(edits) => {
                        regeneration = Some(edits);
                        attempt += 1;
                        info!(step = %step_id, attempt, "regenerating after rejection");
                        continue;
                    }
                    GateOutcome::Skip => return Ok(skipped()),
                    GateOutcome::Fail(reason) => return Ok(fail(reason)),
                }
            }

            return Ok(StepResult {
                step_id: step_id.clone(),
                workflow: node.workflow.clone(),
                status: StepStatus::Completed,
                output: job_result.output,
                parameters: Some(resolved),
                backend: Some(target),
                job_db_id: Some(job_db_id),
                error: None,
            });
        }
    }

    /// Wait for a human decision about the step's latest artifact.
    #[allow(clippy::too_many_arguments)]
    async fn approval_gate(
        &self,
        ctx: &WorkflowCtx,
        node: &ExecutionNode,
        chain_db_id: &str,
        job_db_id: &str,
        resolved: &Value,
        backend: &str,
        policy: ApprovalPolicy,
        attempt: u32,
    ) -> Result<GateOutcome, EngineError> {
        let step_id = &node.step_id;
        let try_id = |op: &str| format!("{step_id}/t{attempt}/{op}");

        let artifact_ids: Vec<String> = match ctx
            .activity(
                &try_id("gate-artifacts"),
                GET_JOB_ARTIFACTS,
                json!({ "job_db_id": job_db_id, "latest_only": true }),
                opts(30, 3, 1_000, 10),
            )
            .await
        {
            Ok(v) => serde_json::from_value(v["artifact_ids"].clone()).unwrap_or_default(),
            Err(e) => return Ok(GateOutcome::Fail(step_error(e)?)),
        };
        let Some(artifact_id) = artifact_ids.first() else {
            warn!(step = %step_id, "nothing to approve; auto-approving");
            return Ok(GateOutcome::Approved);
        };

        let request = match ctx
            .activity(
                &try_id("approval-request"),
                CREATE_APPROVAL_REQUEST,
                json!({
                    "artifact_id": artifact_id,
                    "engine_workflow_id": ctx.workflow_id(),
                    "engine_run_id": ctx.run_id(),
                    "chain_id": chain_db_id,
                    "step_id": step_id,
                    "workflow_name": node.workflow,
                    "backend": backend,
                    "parameters": resolved,
                    "policy": policy,
                }),
                opts(30, 3, 1_000, 10),
            )
            .await
        {
            Ok(v) => v,
            Err(e) => return Ok(GateOutcome::Fail(step_error(e)?)),
        };
        info!(step = %step_id, approval_id = %request["approval_id"], "waiting for approval");

        let timeout = Duration::from_secs_f64(policy.timeout_hours.max(0.0) * 3600.0);
        let decision = ctx
            .wait_signal(
                &try_id("decision"),
                &approval_signal_name(Some(step_id)),
                Some(timeout),
            )
            .await?;

        match decision {
            None => {
                // Deadline: retire the pending request, then apply policy.
                let _ = ctx
                    .activity(
                        &try_id("expire-approval"),
                        CANCEL_APPROVAL_REQUEST,
                        json!({ "approval_id": request["approval_id"] }),
                        opts(30, 3, 1_000, 10),
                    )
                    .await;
                match policy.timeout_action {
                    TimeoutAction::AutoApprove => {
                        info!(step = %step_id, "approval timed out; auto-approving");
                        Ok(GateOutcome::Approved)
                    }
                    TimeoutAction::AutoReject => Ok(GateOutcome::Fail(format!(
                        "approval timed out after {} hours",
                        policy.timeout_hours
                    ))),
                }
            }
            Some(payload) => {
                let decision: ApprovalDecision = serde_json::from_value(payload)
                    .map_err(|e| EngineError::WorkflowFailed(format!("bad approval signal: {e}")))?;
                if decision.is_approved() {
                    info!(step = %step_id, decided_by = %decision.decided_by, "step approved");
                    return Ok(GateOutcome::Approved);
                }
                if policy.on_rejected == OnRejected::Regenerate && attempt < policy.max_retries {
                    return Ok(GateOutcome::Regenerate(decision.parameters));
                }
                match policy.on_rejected {
                    OnRejected::Skip => Ok(GateOutcome::Skip),
                    _ => Ok(GateOutcome::Fail(format!(
                        "rejected by {}{}",
                        decision.decided_by,
                        decision
                            .comment
                            .map(|c| format!(": {c}"))
                            .unwrap_or_default()
                    ))),
                }
            }
        }
    }
}

enum GateOutcome {
    Approved,
    Regenerate(BTreeMap<String, Value>),
    Skip,
    Fail(String),
}
