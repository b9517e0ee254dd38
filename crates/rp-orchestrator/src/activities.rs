// SPDX-License-Identifier: MIT OR Apache-2.0
//! Activity implementations.
//!
//! Activities classify their failures for the engine: transient (network,
//! backend 5xx, store hiccups) retries per policy; permanent (validation,
//! render execution errors) surfaces immediately. Submission is guarded by
//! an intent row so a retried activity never double-submits.

use rp_approval::ApprovalService;
use rp_backend::balancer::LoadBalancer;
use rp_backend::tracker::{track, TrackerConfig, TrackingOutcome};
use rp_backend::wire::HistoryEntry;
use rp_backend::BackendClient;
use rp_chain::{build_context, evaluate_condition, resolve_parameters};
use rp_core::{
    ApprovalPolicy, ChainStatus, JobStatus, MediaKind, OutputFile, SelectionStrategy, StepResult,
    StructuredOutput,
};
use rp_db::{MetadataStore, MetadataStoreError, NewJob, NewTransfer};
use rp_engine::{Activity, ActivityContext, ActivityError, Engine};
use rp_registry::TemplateRegistry;
use rp_store::ArtifactStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

// Activity names, as registered on the engine.
/// Pick a backend via the balancer.
pub const SELECT_BACKEND: &str = "select_backend";
/// Submit a bound workflow and track it to a terminal outcome.
pub const SUBMIT_AND_TRACK: &str = "submit_and_track";
/// Flatten a history record into output files.
pub const EXTRACT_OUTPUT_FILES: &str = "extract_output_files";
/// Download outputs into the store and index artifact rows.
pub const DOWNLOAD_AND_PERSIST: &str = "download_and_persist";
/// Download outputs into the store without touching the database.
pub const DOWNLOAD_ONLY: &str = "download_only";
/// Build the registry-shaped structured output.
pub const BUILD_STRUCTURED_OUTPUT: &str = "build_structured_output";
/// Create the chain row.
pub const CREATE_CHAIN_RECORD: &str = "create_chain_record";
/// Advance the chain row's status.
pub const UPDATE_CHAIN_STATUS: &str = "update_chain_status";
/// Create (or find) the job row for a chain step.
pub const CREATE_JOB_RECORD: &str = "create_job_record";
/// Advance a job row's status.
pub const UPDATE_JOB_STATUS: &str = "update_job_status";
/// Evaluate a step condition against prior results.
pub const EVALUATE_CONDITION: &str = "evaluate_condition";
/// Resolve `{{ ... }}` references in step parameters.
pub const RESOLVE_TEMPLATES: &str = "resolve_templates";
/// Bind override parameters into a template.
pub const APPLY_WORKFLOW_PARAMETERS: &str = "apply_workflow_parameters";
/// Artifact ids of a job, latest by default.
pub const GET_JOB_ARTIFACTS: &str = "get_job_artifacts";
/// Upload artifacts to a target backend's input folder.
pub const TRANSFER_ARTIFACTS: &str = "transfer_artifacts";
/// Create (or find) the pending approval request for an artifact.
pub const CREATE_APPROVAL_REQUEST: &str = "create_approval_request";
/// Cancel a pending approval request (wait expired).
pub const CANCEL_APPROVAL_REQUEST: &str = "cancel_approval_request";

/// Everything the activities need, wired once at startup and shared.
pub struct Services {
    /// Metadata store.
    pub db: MetadataStore,
    /// Artifact file store.
    pub store: ArtifactStore,
    /// Template registry.
    pub registry: Arc<TemplateRegistry>,
    /// Fleet balancer.
    pub balancer: Arc<LoadBalancer>,
    /// Approval service (token issue + row creation).
    pub approvals: Arc<ApprovalService>,
    /// Base URL for artifact view links.
    pub view_url_base: String,
    /// Approval link TTL in hours.
    pub link_ttl_hours: i64,
    /// Tracker knobs; tests shrink these.
    pub tracker: TrackerConfig,
}

fn transient<E: std::fmt::Display>(e: E) -> ActivityError {
    ActivityError::transient(e)
}

fn permanent<E: std::fmt::Display>(e: E) -> ActivityError {
    ActivityError::permanent(e)
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: Value) -> Result<T, ActivityError> {
    serde_json::from_value(input).map_err(|e| permanent(format!("bad activity input: {e}")))
}

fn to_output<T: Serialize>(value: &T) -> Result<Value, ActivityError> {
    serde_json::to_value(value).map_err(|e| permanent(format!("bad activity output: {e}")))
}

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SelectBackendIn {
    strategy: SelectionStrategy,
}

#[derive(Deserialize)]
struct SubmitTrackIn {
    backend: String,
    workflow_json: Value,
    client_id: String,
    intent_id: String,
    #[serde(default)]
    job_db_id: Option<String>,
}

/// Result of [`SUBMIT_AND_TRACK`]; `status` is `completed` or `failed`.
#[derive(Serialize, Deserialize)]
pub struct SubmitTrackOut {
    /// Terminal status of the render.
    pub status: String,
    /// The backend's prompt id.
    pub prompt_id: String,
    /// Full history entry on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryEntry>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct ExtractIn {
    history: HistoryEntry,
}

#[derive(Deserialize)]
struct DownloadPersistIn {
    job_db_id: String,
    backend: String,
    files: Vec<OutputFile>,
}

#[derive(Deserialize)]
struct DownloadOnlyIn {
    backend: String,
    files: Vec<OutputFile>,
}

/// One downloaded file, as returned by the download activities.
#[derive(Serialize, Deserialize)]
pub struct DownloadedFile {
    /// Artifact row id; absent for ephemeral downloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    /// Local store filename.
    pub local_filename: String,
    /// Local store path.
    pub local_path: String,
    /// Filename as the backend produced it.
    pub original_filename: String,
}

#[derive(Deserialize)]
struct StructuredOutputIn {
    #[serde(default)]
    workflow_name: Option<String>,
    files: Vec<OutputFile>,
}

#[derive(Deserialize)]
struct CreateChainIn {
    name: String,
    #[serde(default)]
    description: Option<String>,
    engine_workflow_id: String,
    #[serde(default)]
    engine_run_id: Option<String>,
    definition: Value,
}

#[derive(Deserialize)]
struct UpdateChainIn {
    chain_db_id: String,
    status: ChainStatus,
    #[serde(default)]
    current_level: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct CreateJobIn {
    #[serde(default)]
    chain_id: Option<String>,
    #[serde(default)]
    step_id: Option<String>,
    workflow_name: String,
    backend: String,
    engine_workflow_id: String,
    definition: Value,
    parameters: Value,
}

#[derive(Deserialize)]
struct UpdateJobIn {
    job_db_id: String,
    status: JobStatus,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ConditionIn {
    condition: String,
    step_results: BTreeMap<String, StepResult>,
}

#[derive(Deserialize)]
struct ResolveIn {
    parameters: Map<String, Value>,
    step_results: BTreeMap<String, StepResult>,
}

#[derive(Deserialize)]
struct ApplyParamsIn {
    workflow_name: String,
    parameters: Map<String, Value>,
}

#[derive(Deserialize)]
struct JobArtifactsIn {
    job_db_id: String,
    #[serde(default)]
    latest_only: bool,
}

#[derive(Deserialize)]
struct TransferIn {
    source_job_id: String,
    target_backend: String,
    artifact_ids: Vec<String>,
    #[serde(default)]
    target_job_id: Option<String>,
}

#[derive(Deserialize)]
struct CreateApprovalIn {
    artifact_id: String,
    engine_workflow_id: String,
    #[serde(default)]
    engine_run_id: Option<String>,
    #[serde(default)]
    chain_id: Option<String>,
    #[serde(default)]
    step_id: Option<String>,
    workflow_name: String,
    #[serde(default)]
    backend: Option<String>,
    parameters: Value,
    policy: ApprovalPolicy,
}

#[derive(Deserialize)]
struct CancelApprovalIn {
    approval_id: String,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

struct ServiceActivity<F> {
    name: &'static str,
    services: Arc<Services>,
    run: F,
}

#[async_trait::async_trait]
impl<F, Fut> Activity for ServiceActivity<F>
where
    F: Fn(Arc<Services>, ActivityContext, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ActivityError>> + Send,
{
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        (self.run)(self.services.clone(), ctx, input).await
    }
}

macro_rules! register {
    ($engine:expr, $services:expr, $name:expr, $func:path) => {
        $engine.register_activity(Arc::new(ServiceActivity {
            name: $name,
            services: $services.clone(),
            run: |s, ctx, input| $func(s, ctx, input),
        }));
    };
}

/// Register every activity on the engine.
pub fn register_activities(engine: &Engine, services: Arc<Services>) {
    register!(engine, services, SELECT_BACKEND, select_backend);
    register!(engine, services, SUBMIT_AND_TRACK, submit_and_track);
    register!(engine, services, EXTRACT_OUTPUT_FILES, extract_output_files);
    register!(engine, services, DOWNLOAD_AND_PERSIST, download_and_persist);
    register!(engine, services, DOWNLOAD_ONLY, download_only);
    register!(engine, services, BUILD_STRUCTURED_OUTPUT, build_structured_output);
    register!(engine, services, CREATE_CHAIN_RECORD, create_chain_record);
    register!(engine, services, UPDATE_CHAIN_STATUS, update_chain_status);
    register!(engine, services, CREATE_JOB_RECORD, create_job_record);
    register!(engine, services, UPDATE_JOB_STATUS, update_job_status);
    register!(engine, services, EVALUATE_CONDITION, evaluate_condition_activity);
    register!(engine, services, RESOLVE_TEMPLATES, resolve_templates);
    register!(engine, services, APPLY_WORKFLOW_PARAMETERS, apply_workflow_parameters);
    register!(engine, services, GET_JOB_ARTIFACTS, get_job_artifacts);
    register!(engine, services, TRANSFER_ARTIFACTS, transfer_artifacts);
    register!(engine, services, CREATE_APPROVAL_REQUEST, create_approval_request);
    register!(engine, services, CANCEL_APPROVAL_REQUEST, cancel_approval_request);
}

// ---------------------------------------------------------------------------
// Backend selection and execution
// ---------------------------------------------------------------------------

async fn select_backend(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: SelectBackendIn = parse_input(input)?;
    match s.balancer.pick(input.strategy).await {
        Some(backend) => Ok(json!({ "backend": backend })),
        // Transient so the retry policy gets a chance; the step fails once
        // retries are exhausted.
        None => Err(transient("no backend available")),
    }
}

async fn submit_and_track(
    s: Arc<Services>,
    ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: SubmitTrackIn = parse_input(input)?;
    let client = BackendClient::new(input.backend.clone(), input.client_id.clone());

    // Intent row: a retried attempt that already submitted re-tracks the
    // recorded prompt instead of submitting again.
    let prior = s
        .db
        .record_submit_intent(&input.intent_id, &input.backend)
        .await
        .map_err(transient)?;
    let prompt_id = match prior {
        Some(prompt_id) => {
            info!(intent = %input.intent_id, prompt_id = %prompt_id, "reusing recorded submission");
            prompt_id
        }
        None => {
            let prompt_id = client.submit(input.workflow_json).await.map_err(transient)?;
            s.db
                .fulfil_submit_intent(&input.intent_id, &prompt_id)
                .await
                .map_err(transient)?;
            prompt_id
        }
    };

    if let Some(job_db_id) = &input.job_db_id {
        s.db
            .set_job_prompt_id(job_db_id, &prompt_id)
            .await
            .map_err(transient)?;
        if let Err(e) = s
            .db
            .update_job_status(job_db_id, JobStatus::Executing, None)
            .await
        {
            match e {
                MetadataStoreError::InvalidTransition { .. } => {}
                other => return Err(transient(other)),
            }
        }
    }

    let hb = ctx.clone();
    let outcome = track(
        &client,
        &prompt_id,
        s.tracker,
        Some(Arc::new(move |progress| {
            hb.heartbeat(json!({
                "prompt_id": progress.prompt_id,
                "current_node": progress.current_node,
                "value": progress.value,
                "max": progress.max,
            }));
        })),
    )
    .await;

    let out = match outcome {
        TrackingOutcome::Success { history } => SubmitTrackOut {
            status: "completed".to_string(),
            prompt_id,
            history: Some(history),
            error: None,
        },
        TrackingOutcome::Error { message, history } => SubmitTrackOut {
            status: "failed".to_string(),
            prompt_id,
            history,
            error: Some(message),
        },
        TrackingOutcome::Interrupted => SubmitTrackOut {
            status: "failed".to_string(),
            prompt_id,
            history: None,
            error: Some("execution interrupted".to_string()),
        },
        TrackingOutcome::Unknown { message } => return Err(transient(message)),
    };
    to_output(&out)
}

async fn extract_output_files(
    _s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: ExtractIn = parse_input(input)?;
    Ok(json!({ "files": input.history.output_files() }))
}

// ---------------------------------------------------------------------------
// Downloads
// ---------------------------------------------------------------------------

async fn download_and_persist(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: DownloadPersistIn = parse_input(input)?;
    let client = BackendClient::new(input.backend.clone(), "artifact-downloader");

    // The previous latest becomes the parent of the first new file, so
    // regenerated outputs version under the same job.
    let mut parent = s
        .db
        .get_latest_artifact(&input.job_db_id)
        .await
        .map_err(transient)?
        .map(|a| a.id);

    let mut downloaded = Vec::new();
    for file in &input.files {
        let bytes = client
            .download(&file.filename, &file.subfolder, file.kind)
            .await
            .map_err(transient)?;
        let stored = s
            .store
            .save(&bytes, &file.filename)
            .await
            .map_err(transient)?;
        let format = file
            .filename
            .rsplit('.')
            .next()
            .filter(|e| *e != file.filename)
            .map(|e| e.to_ascii_lowercase());
        let artifact = s
            .db
            .create_artifact(rp_db::NewArtifact {
                job_id: input.job_db_id.clone(),
                original_filename: file.filename.clone(),
                local_filename: stored.local_filename.clone(),
                local_path: stored.local_path.display().to_string(),
                file_type: MediaKind::from_filename(&file.filename),
                file_format: format,
                file_size: Some(stored.size as i64),
                node_id: Some(file.node_id.clone()),
                subfolder: file.subfolder.clone(),
                backend_folder_kind: file.kind.as_str().to_string(),
                parent_artifact_id: parent.take(),
                approval_status: rp_core::ArtifactApprovalStatus::AutoApproved,
                metadata: None,
            })
            .await
            .map_err(transient)?;
        info!(artifact_id = %artifact.id, file = %file.filename, "artifact persisted");
        downloaded.push(DownloadedFile {
            artifact_id: Some(artifact.id),
            local_filename: stored.local_filename,
            local_path: stored.local_path.display().to_string(),
            original_filename: file.filename.clone(),
        });
    }
    Ok(json!({ "files": downloaded }))
}

async fn download_only(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: DownloadOnlyIn = parse_input(input)?;
    let client = BackendClient::new(input.backend.clone(), "artifact-downloader");
    let mut downloaded = Vec::new();
    for file in &input.files {
        let bytes = client
            .download(&file.filename, &file.subfolder, file.kind)
            .await
            .map_err(transient)?;
        let stored = s
            .store
            .save(&bytes, &file.filename)
            .await
            .map_err(transient)?;
        downloaded.push(DownloadedFile {
            artifact_id: None,
            local_filename: stored.local_filename,
            local_path: stored.local_path.display().to_string(),
            original_filename: file.filename.clone(),
        });
    }
    Ok(json!({ "files": downloaded }))
}

async fn build_structured_output(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: StructuredOutputIn = parse_input(input)?;
    let Some(name) = input.workflow_name else {
        return Ok(json!({ "output": null }));
    };
    let Some(descriptor) = s.registry.output(&name) else {
        return Ok(json!({ "output": null }));
    };
    let Some(primary_file) = input.files.first() else {
        return Ok(json!({ "output": null }));
    };
    let mut primary = BTreeMap::new();
    primary.insert(
        descriptor.output_type.as_str().to_string(),
        Value::String(primary_file.filename.clone()),
    );
    let output = StructuredOutput {
        primary,
        kind: descriptor.output_type,
        format: descriptor.format.clone(),
        count: input.files.len(),
        server_files: input.files,
    };
    Ok(json!({ "output": output }))
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

async fn create_chain_record(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: CreateChainIn = parse_input(input)?;
    let chain = s
        .db
        .create_chain(rp_db::NewChain {
            name: input.name,
            description: input.description,
            engine_workflow_id: Some(input.engine_workflow_id),
            engine_run_id: input.engine_run_id,
            definition: Some(input.definition),
        })
        .await
        .map_err(transient)?;
    Ok(json!({ "chain_db_id": chain.id }))
}

async fn update_chain_status(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: UpdateChainIn = parse_input(input)?;
    match s
        .db
        .update_chain_status(
            &input.chain_db_id,
            input.status,
            input.current_level,
            input.error.as_deref(),
        )
        .await
    {
        Ok(_) => Ok(json!({})),
        // A replayed write can trail the row's real state; that is fine.
        Err(MetadataStoreError::InvalidTransition { from, to, .. }) => {
            warn!(chain = %input.chain_db_id, %from, %to, "chain status write ignored");
            Ok(json!({}))
        }
        Err(e) => Err(transient(e)),
    }
}

async fn create_job_record(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: CreateJobIn = parse_input(input)?;
    // Regeneration reuses the step's existing row; (chain_id, step_id) is
    // unique.
    if let (Some(chain_id), Some(step_id)) = (&input.chain_id, &input.step_id) {
        if let Some(existing) = s
            .db
            .find_chain_job(chain_id, step_id)
            .await
            .map_err(transient)?
        {
            return Ok(json!({ "job_db_id": existing.id }));
        }
    }
    let job = s
        .db
        .create_job(NewJob {
            chain_id: input.chain_id,
            step_id: input.step_id,
            workflow_name: input.workflow_name,
            backend_address: input.backend,
            engine_workflow_id: Some(input.engine_workflow_id),
            engine_run_id: None,
            definition: Some(input.definition),
            parameters: Some(input.parameters),
        })
        .await
        .map_err(transient)?;
    Ok(json!({ "job_db_id": job.id }))
}

async fn update_job_status(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: UpdateJobIn = parse_input(input)?;
    match s
        .db
        .update_job_status(&input.job_db_id, input.status, input.error.as_deref())
        .await
    {
        Ok(_) => Ok(json!({})),
        Err(MetadataStoreError::InvalidTransition { from, to, .. }) => {
            warn!(job = %input.job_db_id, %from, %to, "job status write ignored");
            Ok(json!({}))
        }
        Err(e) => Err(transient(e)),
    }
}

// ---------------------------------------------------------------------------
// Chain plumbing
// ---------------------------------------------------------------------------

async fn evaluate_condition_activity(
    _s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: ConditionIn = parse_input(input)?;
    let context = build_context(&input.step_results);
    let result = evaluate_condition(&input.condition, &context).map_err(permanent)?;
    Ok(json!({ "result": result }))
}

async fn resolve_templates(
    _s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: ResolveIn = parse_input(input)?;
    let context = build_context(&input.step_results);
    let resolved = resolve_parameters(&input.parameters, &context).map_err(permanent)?;
    Ok(json!({ "parameters": resolved }))
}

async fn apply_workflow_parameters(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: ApplyParamsIn = parse_input(input)?;
    let overrides: BTreeMap<String, Value> = input.parameters.into_iter().collect();
    let bound = s
        .registry
        .apply_overrides(&input.workflow_name, &overrides)
        .map_err(permanent)?;
    Ok(json!({ "workflow_json": bound }))
}

async fn get_job_artifacts(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: JobArtifactsIn = parse_input(input)?;
    let artifacts = s
        .db
        .list_artifacts(&input.job_db_id, !input.latest_only)
        .await
        .map_err(transient)?;
    let ids: Vec<String> = artifacts.into_iter().map(|a| a.id).collect();
    Ok(json!({ "artifact_ids": ids }))
}

async fn transfer_artifacts(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: TransferIn = parse_input(input)?;
    let client = BackendClient::new(input.target_backend.clone(), "artifact-transfer");
    let mut transferred = Vec::new();

    for artifact_id in &input.artifact_ids {
        let artifact = if artifact_id == "latest" {
            s.db
                .get_latest_artifact(&input.source_job_id)
                .await
                .map_err(transient)?
        } else {
            match s.db.get_artifact(artifact_id).await {
                Ok(a) => Some(a),
                Err(MetadataStoreError::NotFound { .. }) => None,
                Err(e) => return Err(transient(e)),
            }
        };
        let Some(artifact) = artifact else {
            warn!(artifact_id = %artifact_id, "artifact not found; skipping transfer");
            continue;
        };

        let transfer = s
            .db
            .create_transfer(NewTransfer {
                artifact_id: artifact.id.clone(),
                source_job_id: input.source_job_id.clone(),
                target_job_id: input.target_job_id.clone(),
                target_backend: input.target_backend.clone(),
                target_subfolder: artifact.subfolder.clone(),
            })
            .await
            .map_err(transient)?;
        s.db
            .update_transfer_status(&transfer.id, rp_core::TransferStatus::Uploading, None)
            .await
            .map_err(transient)?;

        let uploaded = async {
            let bytes = s
                .store
                .serve(&artifact.local_filename)
                .await
                .map_err(|e| e.to_string())?;
            client
                .upload(bytes, &artifact.original_filename, &artifact.subfolder, true)
                .await
                .map_err(|e| e.to_string())
        }
        .await;

        match uploaded {
            Ok(ack) => {
                s.db
                    .update_transfer_status(&transfer.id, rp_core::TransferStatus::Completed, None)
                    .await
                    .map_err(transient)?;
                info!(
                    artifact_id = %artifact.id,
                    target = %input.target_backend,
                    name = %ack.name,
                    "artifact transferred"
                );
                transferred.push(artifact.original_filename.clone());
            }
            Err(e) => {
                let _ = s
                    .db
                    .update_transfer_status(
                        &transfer.id,
                        rp_core::TransferStatus::Failed,
                        Some(&e),
                    )
                    .await;
                return Err(transient(format!(
                    "transfer of {} to {} failed: {e}",
                    artifact.original_filename, input.target_backend
                )));
            }
        }
    }
    Ok(json!({ "filenames": transferred }))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

async fn create_approval_request(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: CreateApprovalIn = parse_input(input)?;

    // Once-only per artifact: a retried activity returns the request it
    // already created instead of minting a second token.
    if let Some(existing) = s
        .db
        .get_approval_by_artifact(&input.artifact_id)
        .await
        .map_err(transient)?
    {
        if existing.status == rp_core::ApprovalRequestStatus::Pending {
            return Ok(json!({
                "approval_id": existing.id,
                "token": existing.token,
                "view_url": existing.view_url,
            }));
        }
    }

    let config_metadata = json!({
        "workflow_name": input.workflow_name,
        "server": input.backend,
        "parameters": input.parameters,
        "approval_policy": input.policy,
        "step_id": input.step_id,
    });
    let row = s
        .approvals
        .create_request(
            &input.artifact_id,
            &input.engine_workflow_id,
            input.engine_run_id.as_deref(),
            input.chain_id.as_deref(),
            input.step_id.as_deref(),
            &s.view_url_base,
            s.link_ttl_hours,
            config_metadata,
        )
        .await
        .map_err(transient)?;
    s.db
        .set_artifact_approval(
            &input.artifact_id,
            rp_core::ArtifactApprovalStatus::Pending,
            None,
            None,
        )
        .await
        .map_err(transient)?;
    Ok(json!({
        "approval_id": row.id,
        "token": row.token,
        "view_url": row.view_url,
    }))
}

async fn cancel_approval_request(
    s: Arc<Services>,
    _ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let input: CancelApprovalIn = parse_input(input)?;
    match s
        .db
        .decide_approval(
            &input.approval_id,
            rp_core::ApprovalRequestStatus::Cancelled,
            None,
        )
        .await
    {
        Ok(_) => Ok(json!({})),
        // Already decided: the decision raced the timeout and won.
        Err(MetadataStoreError::InvalidTransition { .. }) => Ok(json!({})),
        Err(e) => Err(transient(e)),
    }
}
