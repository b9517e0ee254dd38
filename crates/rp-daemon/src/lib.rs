// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The renderplane daemon: HTTP surface plus the engine worker.
//!
//! The router exposes the approval surface (the only part the core depends
//! on), chain/job submission and status, fleet health, the template
//! listing, and artifact bytes. All state is explicit: one [`AppState`]
//! wired at startup, no process globals.

use axum::extract::{Path as AxPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rp_approval::{ApprovalError, ApprovalService};
use rp_backend::balancer::LoadBalancer;
use rp_chain::{plan, ChainSpec};
use rp_core::{JobStatus, SelectionStrategy};
use rp_db::{MetadataStore, MetadataStoreError};
use rp_engine::Engine;
use rp_orchestrator::{ChainRequest, CHAIN_WORKFLOW, JOB_WORKFLOW};
use rp_registry::{RegistryError, TemplateRegistry};
use rp_store::{ArtifactStore, ArtifactStoreError};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// The durable engine.
    pub engine: Engine,
    /// Metadata store.
    pub db: MetadataStore,
    /// Artifact file store.
    pub store: ArtifactStore,
    /// Template registry.
    pub registry: Arc<TemplateRegistry>,
    /// Fleet balancer.
    pub balancer: Arc<LoadBalancer>,
    /// Approval service.
    pub approvals: Arc<ApprovalService>,
}

/// Structured API error.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Message for the body.
    pub message: String,
    /// Optional structured details (validation issue lists).
    pub details: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.message });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<MetadataStoreError> for ApiError {
    fn from(e: MetadataStoreError) -> Self {
        match &e {
            MetadataStoreError::NotFound { .. } => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
            MetadataStoreError::InvalidTransition { .. } => {
                ApiError::new(StatusCode::CONFLICT, e.to_string())
            }
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        match &e {
            ApprovalError::TokenNotFound => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
            ApprovalError::AlreadyDecided(_) => ApiError::new(StatusCode::CONFLICT, e.to_string()),
            ApprovalError::Expired => ApiError::new(StatusCode::GONE, e.to_string()),
            ApprovalError::InvalidParameters(issues) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid parameters").with_details(
                    serde_json::to_value(issues).unwrap_or(Value::Null),
                )
            }
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match &e {
            RegistryError::UnknownTemplate(_) => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
            RegistryError::NotOverridable { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, e.to_string())
            }
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<rp_engine::EngineError> for ApiError {
    fn from(e: rp_engine::EngineError) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

/// Build the router.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers", get(list_servers))
        .route("/workflows", get(list_workflows))
        .route("/workflows/{name}/parameters", get(workflow_parameters))
        .route("/artifacts/{local_filename}", get(serve_artifact))
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/chains", post(submit_chain))
        .route("/chains/{id}", get(get_chain))
        .route("/approval/{token}", get(approval_details))
        .route("/approval/{token}/parameters", get(approval_parameters))
        .route("/approval/{token}/approve", post(approval_approve))
        .route("/approval/{token}/reject", post(approval_reject))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health and fleet
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "backends": state.balancer.backends().len(),
        "templates": state.registry.names().len(),
    }))
}

async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    state.balancer.refresh().await;
    Json(state.balancer.snapshots().await)
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

async fn list_workflows(State(state): State<AppState>) -> impl IntoResponse {
    let listing: Vec<Value> = state
        .registry
        .names()
        .into_iter()
        .filter_map(|name| {
            state.registry.get(&name).map(|info| {
                json!({
                    "name": info.name,
                    "description": info.description,
                    "parameters": info.parameters.len(),
                    "output_type": info.output.as_ref().map(|o| o.output_type),
                    "hash": info.hash,
                })
            })
        })
        .collect();
    Json(listing)
}

async fn workflow_parameters(
    AxPath(name): AxPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let parameters = state
        .registry
        .parameters(&name)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("workflow '{name}' not found")))?;
    Ok(Json(json!({ "workflow_name": name, "parameters": parameters })))
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next().unwrap_or("") {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

async fn serve_artifact(
    AxPath(local_filename): AxPath<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let bytes = state.store.serve(&local_filename).await.map_err(|e| match e {
        ArtifactStoreError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
        other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    })?;
    Ok((
        [(header::CONTENT_TYPE, content_type_for(&local_filename))],
        bytes,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SubmitJobBody {
    /// Template name; mutually completing with `workflow_json`.
    #[serde(default)]
    workflow_name: Option<String>,
    /// Override parameters keyed `"<node>.<key>"`.
    #[serde(default)]
    overrides: BTreeMap<String, Value>,
    /// A pre-bound workflow document, for callers bypassing the registry.
    #[serde(default)]
    workflow_json: Option<Value>,
    #[serde(default)]
    strategy: SelectionStrategy,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<SubmitJobBody>,
) -> Result<Json<Value>, ApiError> {
    // Bind before creating any row: an unknown override must leave no trace.
    let (workflow_json, workflow_name) = match (&body.workflow_json, &body.workflow_name) {
        (Some(doc), name) => (doc.clone(), name.clone()),
        (None, Some(name)) => {
            let bound = state.registry.apply_overrides(name, &body.overrides)?;
            (bound, Some(name.clone()))
        }
        (None, None) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "either workflow_name or workflow_json is required",
            ))
        }
    };

    let engine_workflow_id = format!("job-{}", Uuid::new_v4());
    let job = state
        .db
        .create_job(rp_db::NewJob {
            chain_id: None,
            step_id: None,
            workflow_name: workflow_name.clone().unwrap_or_else(|| "ad-hoc".to_string()),
            backend_address: String::new(),
            engine_workflow_id: Some(engine_workflow_id.clone()),
            engine_run_id: None,
            definition: Some(workflow_json.clone()),
            parameters: Some(json!(body.overrides)),
        })
        .await?;

    state
        .engine
        .start(
            JOB_WORKFLOW,
            &engine_workflow_id,
            serde_json::to_value(rp_core::JobRequest {
                workflow_json,
                strategy: body.strategy,
                workflow_name,
                pre_selected_backend: None,
                job_db_id: Some(job.id.clone()),
            })
            .expect("job request serialises"),
        )
        .await?;

    info!(job_id = %job.id, workflow_id = %engine_workflow_id, "job submitted");
    Ok(Json(json!({
        "job_id": job.id,
        "workflow_id": engine_workflow_id,
    })))
}

async fn get_job(
    AxPath(id): AxPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let job = state.db.get_job(&id).await?;
    let latest = state.db.get_latest_artifact(&id).await?;
    let live = match &job.engine_workflow_id {
        Some(wf) => state.engine.query_state(wf).await,
        None => None,
    };
    let heartbeat = match &job.engine_workflow_id {
        Some(wf) => state.engine.last_heartbeat(wf).await,
        None => None,
    };
    Ok(Json(json!({
        "job": job,
        "latest_artifact": latest,
        "live_state": live,
        "progress": heartbeat,
    })))
}

async fn cancel_job(
    AxPath(id): AxPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let job = state.db.get_job(&id).await?;
    if let Some(wf) = &job.engine_workflow_id {
        state.engine.cancel(wf).await?;
    }
    // Ask the backend to stop rendering; advisory, the row is cancelled
    // either way.
    if job.backend_prompt_id.is_some() && !job.backend_address.is_empty() {
        let client = rp_backend::BackendClient::new(job.backend_address.clone(), "cancel");
        if let Err(e) = client.interrupt().await {
            tracing::warn!(job_id = %id, error = %e, "backend interrupt failed");
        }
    }
    let job = state
        .db
        .update_job_status(&id, JobStatus::Cancelled, Some("cancelled by request"))
        .await?;
    Ok(Json(json!({ "job_id": job.id, "status": job.status })))
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SubmitChainBody {
    /// The chain spec (same shape as the YAML files).
    definition: Value,
    #[serde(default)]
    initial_parameters: Option<Map<String, Value>>,
}

async fn submit_chain(
    State(state): State<AppState>,
    Json(body): Json<SubmitChainBody>,
) -> Result<Json<Value>, ApiError> {
    let spec = ChainSpec::from_json(body.definition)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let execution_plan =
        plan(&spec).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let workflow_id = format!("chain-{}", Uuid::new_v4());
    state
        .engine
        .start(
            CHAIN_WORKFLOW,
            &workflow_id,
            serde_json::to_value(ChainRequest {
                plan: execution_plan,
                initial_parameters: body.initial_parameters,
            })
            .expect("chain request serialises"),
        )
        .await?;

    info!(chain = %spec.name, workflow_id = %workflow_id, "chain submitted");
    Ok(Json(json!({
        "chain_name": spec.name,
        "workflow_id": workflow_id,
    })))
}

async fn get_chain(
    AxPath(id): AxPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let chain = state.db.get_chain(&id).await?;
    let jobs = state.db.list_jobs(Some(&id), None).await?;
    let live = match &chain.engine_workflow_id {
        Some(wf) => state.engine.query_state(wf).await,
        None => None,
    };
    Ok(Json(json!({ "chain": chain, "jobs": jobs, "live_state": live })))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

async fn approval_details(
    AxPath(token): AxPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let details = state.approvals.details(&token).await?;
    Ok(Json(serde_json::to_value(details).unwrap_or(Value::Null)))
}

async fn approval_parameters(
    AxPath(token): AxPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.approvals.editable_parameters(&token).await?))
}

#[derive(Deserialize)]
struct ApproveBody {
    decided_by: String,
}

async fn approval_approve(
    AxPath(token): AxPath<String>,
    State(state): State<AppState>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.approvals.approve(&token, &body.decided_by).await?))
}

#[derive(Deserialize)]
struct RejectBody {
    decided_by: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default)]
    rejection_comment: Option<String>,
}

async fn approval_reject(
    AxPath(token): AxPath<String>,
    State(state): State<AppState>,
    Json(body): Json<RejectBody>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(
        state
            .approvals
            .reject(
                &token,
                &body.decided_by,
                body.parameters,
                body.rejection_comment,
            )
            .await?,
    ))
}
