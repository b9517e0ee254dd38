// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-job scenarios: the happy path, override validation, the tracker
//! race, and backend-reported failures.

mod common;

use common::{harness, mock_backend, mount_error, mount_image_success, tiny_image_template};
use rp_core::{JobRequest, JobResult, JobStatus, MediaKind, SelectionStrategy};
use rp_engine::InMemoryHistoryStore;
use rp_orchestrator::JOB_WORKFLOW;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn start_job(
    h: &common::Harness,
    workflow_name: &str,
    overrides: BTreeMap<String, Value>,
) -> (String, JobResult) {
    let bound = h.registry.apply_overrides(workflow_name, &overrides).unwrap();
    let workflow_id = format!("job-{}", uuid::Uuid::new_v4());
    let job = h
        .db
        .create_job(rp_db::NewJob {
            workflow_name: workflow_name.to_string(),
            backend_address: String::new(),
            engine_workflow_id: Some(workflow_id.clone()),
            definition: Some(bound.clone()),
            parameters: Some(json!(overrides)),
            ..rp_db::NewJob::default()
        })
        .await
        .unwrap();
    let handle = h
        .engine
        .start(
            JOB_WORKFLOW,
            &workflow_id,
            serde_json::to_value(JobRequest {
                workflow_json: bound,
                strategy: SelectionStrategy::LeastLoaded,
                workflow_name: Some(workflow_name.to_string()),
                pre_selected_backend: None,
                job_db_id: Some(job.id.clone()),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let result: JobResult = serde_json::from_value(handle.result().await.unwrap()).unwrap();
    (job.id, result)
}

// The happy path: submit a template job, track it, index the output.
#[tokio::test]
async fn single_job_happy_path() {
    let backend = mock_backend().await;
    mount_image_success(&backend, "p-1", "render_00001.png").await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let mut overrides = BTreeMap::new();
    overrides.insert("3.text".to_string(), json!("hi"));
    let (job_id, result) = start_job(&h, "tiny", overrides).await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.prompt_id, "p-1");
    let output = result.output.expect("structured output");
    assert_eq!(output.kind, MediaKind::Image);
    assert_eq!(output.server_files.len(), 1);
    assert_eq!(output.primary["image"], json!("render_00001.png"));

    // Exactly one artifact row, latest, pointed at by the job.
    let job = h.db.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let artifact = h.db.get_latest_artifact(&job_id).await.unwrap().unwrap();
    assert!(artifact.is_latest);
    assert_eq!(artifact.original_filename, "render_00001.png");
    assert_eq!(job.latest_artifact_id, Some(artifact.id.clone()));

    // The bytes landed in the store.
    let bytes = h.store.serve(&artifact.local_filename).await.unwrap();
    assert_eq!(bytes, b"RENDERED-BYTES");
}

// An unknown override is rejected before anything is created.
#[tokio::test]
async fn unknown_override_rejected_without_rows() {
    let backend = mock_backend().await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let mut overrides = BTreeMap::new();
    overrides.insert("9999.foo".to_string(), json!(1));
    let err = h.registry.apply_overrides("tiny", &overrides).unwrap_err();
    assert!(err.to_string().contains("9999.foo"));
    assert!(h.db.list_jobs(None, None).await.unwrap().is_empty());
}

// The tracker resolves via polling when the websocket never connects.
// The mock backend has no /ws endpoint at all and history is present from
// the start; the poll path must complete the job well inside two seconds.
#[tokio::test]
async fn tracker_poll_path_wins_quickly() {
    let backend = mock_backend().await;
    mount_image_success(&backend, "p-1", "fast.png").await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let started = Instant::now();
    let (_job_id, result) = start_job(&h, "tiny", BTreeMap::new()).await;
    assert_eq!(result.status, JobStatus::Completed);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "poll path took {:?}",
        started.elapsed()
    );
}

// A backend-reported execution error fails the job with the backend's
// message, verbatim.
#[tokio::test]
async fn backend_error_fails_job_with_message() {
    let backend = mock_backend().await;
    mount_error(&backend, "p-1", "boom").await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let (job_id, result) = start_job(&h, "tiny", BTreeMap::new()).await;
    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.error.as_deref().unwrap_or_default().contains("boom"));

    let job = h.db.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("boom"));
    assert!(h.db.get_latest_artifact(&job_id).await.unwrap().is_none());
}
