// SPDX-License-Identifier: MIT OR Apache-2.0
//! Crash recovery: a worker dies mid-workflow; on restart the engine
//! replays the history and finishes the job without re-submitting to the
//! backend.

mod common;

use common::{harness, mock_backend, mount_image_success, tiny_image_template};
use rp_core::{JobRequest, JobStatus, SelectionStrategy};
use rp_engine::{FileHistoryStore, HistoryEvent, HistoryStore};
use rp_orchestrator::activities::SubmitTrackOut;
use serde_json::json;
use std::sync::Arc;

async fn prompt_submissions(server: &wiremock::MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/prompt")
        .count()
}

/// Crash between `submit_and_track` and `download_and_persist`: the
/// tracking result is already in the history, so the restarted worker goes
/// straight to downloads.
#[tokio::test]
async fn resume_after_tracked_render_downloads_without_resubmit() {
    let backend = mock_backend().await;
    let state_dir = tempfile::tempdir().unwrap();
    let history: Arc<dyn HistoryStore> =
        Arc::new(FileHistoryStore::open(state_dir.path()).await.unwrap());

    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        history.clone(),
    )
    .await;

    // The pre-crash world: a job row tracked to `executing` with its prompt
    // id recorded...
    let bound = h
        .registry
        .apply_overrides("tiny", &std::collections::BTreeMap::new())
        .unwrap();
    let job = h
        .db
        .create_job(rp_db::NewJob {
            workflow_name: "tiny".to_string(),
            backend_address: backend.uri(),
            engine_workflow_id: Some("job-crash".to_string()),
            definition: Some(bound.clone()),
            ..rp_db::NewJob::default()
        })
        .await
        .unwrap();
    h.db.set_job_prompt_id(&job.id, "p-crash").await.unwrap();
    h.db.update_job_status(&job.id, JobStatus::Executing, None)
        .await
        .unwrap();

    // ...and a workflow history that ends right after the tracking
    // activity completed.
    let input = serde_json::to_value(JobRequest {
        workflow_json: bound,
        strategy: SelectionStrategy::LeastLoaded,
        workflow_name: Some("tiny".to_string()),
        pre_selected_backend: Some(backend.uri()),
        job_db_id: Some(job.id.clone()),
    })
    .unwrap();
    history
        .append(
            "job-crash",
            &HistoryEvent::WorkflowStarted {
                workflow_type: "render_job".to_string(),
                input,
                run_id: "r-crash".to_string(),
                started_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    let tracked = SubmitTrackOut {
        status: "completed".to_string(),
        prompt_id: "p-crash".to_string(),
        history: Some(
            serde_json::from_value(json!({
                "outputs": {"9": {"images": [{"filename": "render_00001.png"}]}},
                "status": {"status_str": "success", "completed": true, "messages": []}
            }))
            .unwrap(),
        ),
        error: None,
    };
    history
        .append(
            "job-crash",
            &HistoryEvent::ActivityCompleted {
                id: "execute".to_string(),
                name: "submit_and_track".to_string(),
                result: serde_json::to_value(&tracked).unwrap(),
            },
        )
        .await
        .unwrap();

    // Worker restart.
    let handles = h.engine.resume_all().await.unwrap();
    assert_eq!(handles.len(), 1);
    let result = handles[0].result().await.unwrap();
    assert_eq!(result["status"], "completed");
    assert_eq!(result["prompt_id"], "p-crash");

    // The backend never saw a second submission.
    assert_eq!(prompt_submissions(&backend).await, 0);

    let job = h.db.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.backend_prompt_id.as_deref(), Some("p-crash"));
    let artifact = h.db.get_latest_artifact(&job.id).await.unwrap().unwrap();
    assert!(artifact.is_latest);
    assert_eq!(artifact.original_filename, "render_00001.png");
}

/// Crash inside `submit_and_track`, after the backend accepted the prompt
/// but before the activity completed: the intent row stops the retried
/// activity from submitting twice.
#[tokio::test]
async fn resume_mid_submit_reuses_intent_recorded_prompt() {
    let backend = mock_backend().await;
    mount_image_success(&backend, "p-9", "render_00002.png").await;
    let state_dir = tempfile::tempdir().unwrap();
    let history: Arc<dyn HistoryStore> =
        Arc::new(FileHistoryStore::open(state_dir.path()).await.unwrap());

    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        history.clone(),
    )
    .await;

    let bound = h
        .registry
        .apply_overrides("tiny", &std::collections::BTreeMap::new())
        .unwrap();
    let job = h
        .db
        .create_job(rp_db::NewJob {
            workflow_name: "tiny".to_string(),
            backend_address: backend.uri(),
            engine_workflow_id: Some("job-crash2".to_string()),
            definition: Some(bound.clone()),
            ..rp_db::NewJob::default()
        })
        .await
        .unwrap();

    // The crashed attempt got as far as submitting: intent fulfilled, no
    // activity completion in the history.
    h.db.record_submit_intent("job-crash2:submit", &backend.uri())
        .await
        .unwrap();
    h.db.fulfil_submit_intent("job-crash2:submit", "p-9")
        .await
        .unwrap();

    let input = serde_json::to_value(JobRequest {
        workflow_json: bound,
        strategy: SelectionStrategy::LeastLoaded,
        workflow_name: Some("tiny".to_string()),
        pre_selected_backend: Some(backend.uri()),
        job_db_id: Some(job.id.clone()),
    })
    .unwrap();
    history
        .append(
            "job-crash2",
            &HistoryEvent::WorkflowStarted {
                workflow_type: "render_job".to_string(),
                input,
                run_id: "r-crash2".to_string(),
                started_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();

    let handles = h.engine.resume_all().await.unwrap();
    assert_eq!(handles.len(), 1);
    let result = handles[0].result().await.unwrap();
    assert_eq!(result["status"], "completed");
    assert_eq!(result["prompt_id"], "p-9");

    // The recorded intent covered the submission; zero live submits.
    assert_eq!(prompt_submissions(&backend).await, 0);

    let job = h.db.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.backend_prompt_id.as_deref(), Some("p-9"));
}
