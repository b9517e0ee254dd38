// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval-policy and condition paths: timeout actions, skip-on-reject,
//! and conditional step skipping.

mod common;

use common::{harness, mock_backend, mount_image_success, tiny_image_template, wait_for};
use rp_chain::{plan, ChainSpec};
use rp_core::{ApprovalRequestStatus, ChainRunResult, StepStatus};
use rp_engine::InMemoryHistoryStore;
use rp_orchestrator::{ChainRequest, CHAIN_WORKFLOW};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

async fn run_chain(h: &common::Harness, definition: Value) -> rp_engine::WorkflowHandle {
    let spec = ChainSpec::from_json(definition).unwrap();
    let execution_plan = plan(&spec).unwrap();
    let workflow_id = format!("chain-{}", uuid::Uuid::new_v4());
    h.engine
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
        .unwrap()
}

// A false condition skips the step without creating a job row; the chain
// still completes.
#[tokio::test]
async fn false_condition_skips_step() {
    let backend = mock_backend().await;
    mount_image_success(&backend, "p-1", "first.png").await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let handle = run_chain(
        &h,
        json!({
            "name": "conditional",
            "steps": [
                {"id": "a", "workflow": "tiny", "parameters": {}},
                {"id": "b", "workflow": "tiny", "depends_on": ["a"],
                 "condition": "{{ a.output.count }} > 5"}
            ]
        }),
    )
    .await;

    let result: ChainRunResult = serde_json::from_value(handle.result().await.unwrap()).unwrap();
    assert_eq!(result.status, "completed");
    assert_eq!(result.step_results["a"].status, StepStatus::Completed);
    assert_eq!(result.step_results["b"].status, StepStatus::Skipped);

    let chains = h.db.list_chains(Some("completed")).await.unwrap();
    let jobs = h.db.list_jobs(Some(&chains[0].id), None).await.unwrap();
    assert_eq!(jobs.len(), 1, "the skipped step must not create a job row");
}

// No decision before the (tiny) deadline with `auto_approve`: the pending
// request is retired and the chain completes.
#[tokio::test]
async fn approval_timeout_auto_approves() {
    let backend = mock_backend().await;
    mount_image_success(&backend, "p-1", "late.png").await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let handle = run_chain(
        &h,
        json!({
            "name": "timed",
            "steps": [{
                "id": "gate",
                "workflow": "tiny",
                "parameters": {
                    "requires_approval": true,
                    // Roughly one second.
                    "approval": {"timeout_hours": 0.0003, "timeout_action": "auto_approve"}
                }
            }]
        }),
    )
    .await;

    let result: ChainRunResult = serde_json::from_value(handle.result().await.unwrap()).unwrap();
    assert_eq!(result.status, "completed");
    assert_eq!(result.step_results["gate"].status, StepStatus::Completed);

    // The request row ended cancelled, not pending.
    let chains = h.db.list_chains(None).await.unwrap();
    let requests = h.db.list_approvals_for_chain(&chains[0].id).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].status, ApprovalRequestStatus::Cancelled);
}

// Timeout with the default `auto_reject` fails the step and the chain.
#[tokio::test]
async fn approval_timeout_auto_rejects_by_default() {
    let backend = mock_backend().await;
    mount_image_success(&backend, "p-1", "late.png").await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let handle = run_chain(
        &h,
        json!({
            "name": "timed-reject",
            "steps": [{
                "id": "gate",
                "workflow": "tiny",
                "parameters": {
                    "requires_approval": true,
                    "approval": {"timeout_hours": 0.0003}
                }
            }]
        }),
    )
    .await;

    let result: ChainRunResult = serde_json::from_value(handle.result().await.unwrap()).unwrap();
    assert_eq!(result.status, "failed");
    assert_eq!(result.step_results["gate"].status, StepStatus::Failed);
    assert!(result.error.unwrap().contains("timed out"));
}

// `on_rejected: skip` turns a rejection into a skipped step; the chain
// still completes.
#[tokio::test]
async fn rejection_with_skip_policy_skips_step() {
    let backend = mock_backend().await;
    mount_image_success(&backend, "p-1", "meh.png").await;
    let h = harness(
        vec![&backend],
        &[("tiny", tiny_image_template())],
        Arc::new(InMemoryHistoryStore::new()),
    )
    .await;

    let handle = run_chain(
        &h,
        json!({
            "name": "skippable",
            "steps": [{
                "id": "gate",
                "workflow": "tiny",
                "parameters": {
                    "requires_approval": true,
                    "approval": {"on_rejected": "skip"}
                }
            }]
        }),
    )
    .await;

    let db = h.db.clone();
    let request = wait_for(Duration::from_secs(10), || {
        let db = db.clone();
        async move {
            let chains = db.list_chains(None).await.unwrap();
            let chain = chains.first()?;
            db.list_approvals_for_chain(&chain.id)
                .await
                .unwrap()
                .into_iter()
                .find(|r| r.status == ApprovalRequestStatus::Pending)
        }
    })
    .await;

    h.approvals
        .reject(&request.token, "qa@example", BTreeMap::new(), None)
        .await
        .unwrap();

    let result: ChainRunResult = serde_json::from_value(handle.result().await.unwrap()).unwrap();
    assert_eq!(result.status, "completed");
    assert_eq!(result.step_results["gate"].status, StepStatus::Skipped);
}
