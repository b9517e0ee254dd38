// SPDX-License-Identifier: MIT OR Apache-2.0
//! Chain scenarios: dependency transfer, approval-driven regeneration, and
//! cycle rejection.

mod common;

use common::{
    harness, mock_backend, mount_image_success, mount_video_success, tiny_image_template,
    video_template, wait_for,
};
use rp_chain::{plan, ChainSpec};
use rp_core::{ApprovalRequestStatus, ChainRunResult, JobStatus, StepStatus, TransferStatus};
use rp_engine::InMemoryHistoryStore;
use rp_orchestrator::{ChainRequest, CHAIN_WORKFLOW};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

async fn start_chain(
    h: &common::Harness,
    definition: Value,
) -> (String, rp_engine::WorkflowHandle) {
    let spec = ChainSpec::from_json(definition).unwrap();
    let execution_plan = plan(&spec).unwrap();
    let workflow_id = format!("chain-{}", uuid::Uuid::new_v4());
    let handle = h
        .engine
        .start(
            CHAIN_WORKFLOW,
            &workflow_id,
            serde_json::to_value(ChainRequest {
                plan: execution_plan,
                initial_parameters: None,
            })
            .unwrap(),
        )
        .await
        .unwrap();
    (workflow_id, handle)
}

// A two-step chain transfers the upstream artifact onto the
// downstream backend and resolves the template reference.
#[tokio::test]
async fn two_step_chain_with_dependency() {
    let backend = mock_backend().await;
    // Level 0 submits first (p-1), level 1 second (p-2).
    mount_video_success(&backend, "p-1", "clip_00001.mp4").await;
    mount_video_success(&backend, "p-2", "final_00001.mp4").await;
    let h = harness(
        vec![&backend],
        &[("gen", video_template()), ("anim", video_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let (_wf, handle) = start_chain(
        &h,
        json!({
            "name": "two-step",
            "steps": [
                {"id": "a", "workflow": "gen", "parameters": {}},
                {"id": "b", "workflow": "anim", "depends_on": ["a"],
                 "parameters": {"input": "{{ a.output.video }}"}}
            ]
        }),
    )
    .await;

    let result: ChainRunResult = serde_json::from_value(handle.result().await.unwrap()).unwrap();
    assert_eq!(result.status, "completed");
    assert_eq!(result.step_results.len(), 2);
    assert_eq!(result.step_results["a"].status, StepStatus::Completed);
    assert_eq!(result.step_results["b"].status, StepStatus::Completed);

    // The reference resolved to a's concrete filename.
    let b_params = result.step_results["b"].parameters.as_ref().unwrap();
    assert_eq!(b_params["input"], json!("clip_00001.mp4"));

    // Chain row terminal, both jobs completed.
    let chains = h.db.list_chains(Some("completed")).await.unwrap();
    assert_eq!(chains.len(), 1);
    let jobs = h.db.list_jobs(Some(&chains[0].id), None).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));

    // Exactly one completed transfer of a's artifact, and the upload hit
    // the backend's input endpoint.
    let a_job = result.step_results["a"].job_db_id.as_ref().unwrap();
    let a_artifact = h.db.get_latest_artifact(a_job).await.unwrap().unwrap();
    let transfers = h.db.list_transfers_for_artifact(&a_artifact.id).await.unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].status, TransferStatus::Completed);
    assert!(transfers[0].uploaded_at.is_some());

    let uploads: usize = backend
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/upload/image")
        .count();
    assert_eq!(uploads, 1);
}

// Rejection with new parameters regenerates the step under the same
// job, versioning the artifact; the second round approves.
#[tokio::test]
async fn approval_rejection_regenerates_same_job() {
    let backend = mock_backend().await;
    mount_image_success(&backend, "p-1", "portrait_v1.png").await;
    mount_image_success(&backend, "p-2", "portrait_v2.png").await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let (_wf, handle) = start_chain(
        &h,
        json!({
            "name": "gated",
            "steps": [{
                "id": "portrait",
                "workflow": "tiny",
                "parameters": {
                    "requires_approval": true,
                    "approval": {"on_rejected": "regenerate", "max_retries": 2}
                }
            }]
        }),
    )
    .await;

    // First approval request appears once the first render lands.
    let db = h.db.clone();
    let first = wait_for(Duration::from_secs(10), || {
        let db = db.clone();
        async move {
            let chains = db.list_chains(None).await.unwrap();
            let chain = chains.first()?;
            let pending = db.list_approvals_for_chain(&chain.id).await.unwrap();
            pending
                .into_iter()
                .find(|r| r.status == ApprovalRequestStatus::Pending)
        }
    })
    .await;

    // Reject with a new seed.
    let mut edits = BTreeMap::new();
    edits.insert("5.seed".to_string(), json!(42));
    h.approvals
        .reject(&first.token, "qa@example", edits, Some("try another seed".into()))
        .await
        .unwrap();

    // Second approval request (new artifact) appears after regeneration.
    let db = h.db.clone();
    let first_id = first.id.clone();
    let second = wait_for(Duration::from_secs(10), || {
        let db = db.clone();
        let first_id = first_id.clone();
        async move {
            let chains = db.list_chains(None).await.unwrap();
            let chain = chains.first()?;
            let requests = db.list_approvals_for_chain(&chain.id).await.unwrap();
            requests
                .into_iter()
                .find(|r| r.id != first_id && r.status == ApprovalRequestStatus::Pending)
        }
    })
    .await;
    h.approvals.approve(&second.token, "qa@example").await.unwrap();

    let result: ChainRunResult = serde_json::from_value(handle.result().await.unwrap()).unwrap();
    assert_eq!(result.status, "completed");
    let step = &result.step_results["portrait"];
    assert_eq!(step.status, StepStatus::Completed);

    // Same job, two artifact versions, v2 latest.
    let job_id = step.job_db_id.as_ref().unwrap();
    let all = h.db.list_artifacts(job_id, true).await.unwrap();
    assert_eq!(all.len(), 2);
    let latest = h.db.get_latest_artifact(job_id).await.unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.original_filename, "portrait_v2.png");
    assert_eq!(
        latest.parent_artifact_id,
        Some(all.iter().find(|a| a.version == 1).unwrap().id.clone())
    );

    // The regenerated submission carried the edited seed.
    let prompts: Vec<Value> = backend
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/prompt")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[1]["prompt"]["5"]["inputs"]["seed"], json!(42));
}

// A cyclic chain is rejected at planning time; nothing is written.
#[tokio::test]
async fn cyclic_chain_rejected_before_any_rows() {
    let backend = mock_backend().await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let spec = ChainSpec::from_json(json!({
        "name": "loop",
        "steps": [
            {"id": "a", "workflow": "tiny", "depends_on": ["b"]},
            {"id": "b", "workflow": "tiny", "depends_on": ["a"]}
        ]
    }))
    .unwrap();
    let err = plan(&spec).unwrap_err();
    assert!(err.to_string().contains("cycle"));

    assert!(h.db.list_chains(None).await.unwrap().is_empty());
    assert!(h.db.list_jobs(None, None).await.unwrap().is_empty());
}
