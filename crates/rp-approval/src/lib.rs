// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The approval service.
//!
//! Every approval request carries a one-shot token: 32 bytes of OS entropy,
//! URL-safe base64. The token validates only while the request is pending
//! and unexpired; the first decision revokes it. Rejections may carry
//! replacement parameters, validated against the template's override file
//! before the waiting chain workflow is signalled.

/// Parameter validation against the override contract.
pub mod validate;

pub use validate::{validate_parameters, ParameterIssue};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use rand::RngCore;
use rp_core::{approval_signal_name, ApprovalDecision, ApprovalRequestStatus};
use rp_db::{ApprovalRequestRow, MetadataStore, MetadataStoreError, NewApprovalRequest};
use rp_engine::Engine;
use rp_registry::TemplateRegistry;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Approval operation failures.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// No request carries that token.
    #[error("approval link not found")]
    TokenNotFound,

    /// The request already received its decision.
    #[error("approval link already used (status: {0})")]
    AlreadyDecided(String),

    /// The link expired before a decision arrived.
    #[error("approval link expired")]
    Expired,

    /// Rejection parameters failed validation; every issue listed.
    #[error("invalid parameters: {0:?}")]
    InvalidParameters(Vec<ParameterIssue>),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] MetadataStoreError),

    /// Signalling the workflow failed.
    #[error("failed to signal workflow: {0}")]
    Signal(String),
}

/// Generate a fresh one-shot token: 32 bytes of OS entropy, URL-safe
/// base64, no padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Details handed to the approval UI for one token.
#[derive(Clone, Debug, Serialize)]
pub struct ApprovalDetails {
    /// Request row id.
    pub approval_request_id: String,
    /// The token, echoed back.
    pub token: String,
    /// Current status.
    pub status: ApprovalRequestStatus,
    /// Artifact summary.
    pub artifact: Value,
    /// Workflow name, server, parameters used.
    pub generation_info: Value,
    /// Expiry, RFC 3339, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// The service: explicit value wired at startup, shared by the HTTP surface.
pub struct ApprovalService {
    db: MetadataStore,
    registry: Arc<TemplateRegistry>,
    engine: Engine,
}

impl ApprovalService {
    /// Wire the service.
    pub fn new(db: MetadataStore, registry: Arc<TemplateRegistry>, engine: Engine) -> Self {
        Self {
            db,
            registry,
            engine,
        }
    }

    /// Create a pending request for an artifact; returns the stored row
    /// (token included).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_request(
        &self,
        artifact_id: &str,
        engine_workflow_id: &str,
        engine_run_id: Option<&str>,
        chain_id: Option<&str>,
        step_id: Option<&str>,
        view_url_base: &str,
        link_ttl_hours: i64,
        config_metadata: Value,
    ) -> Result<ApprovalRequestRow, ApprovalError> {
        let token = generate_token();
        let link_expires_at = (link_ttl_hours > 0).then(|| Utc::now() + Duration::hours(link_ttl_hours));
        let view_url = format!("{}/artifacts/{}", view_url_base.trim_end_matches('/'), artifact_id);
        let row = self
            .db
            .create_approval_request(NewApprovalRequest {
                artifact_id: artifact_id.to_string(),
                chain_id: chain_id.map(str::to_string),
                step_id: step_id.map(str::to_string),
                engine_workflow_id: engine_workflow_id.to_string(),
                engine_run_id: engine_run_id.map(str::to_string),
                token,
                view_url,
                link_expires_at,
                config_metadata,
            })
            .await?;
        info!(approval_id = %row.id, artifact_id, "approval request issued");
        Ok(row)
    }

    /// Validate a token: must exist, be pending, and be unexpired.
    async fn validated(&self, token: &str) -> Result<ApprovalRequestRow, ApprovalError> {
        let row = self
            .db
            .get_approval_by_token(token)
            .await?
            .ok_or(ApprovalError::TokenNotFound)?;
        if row.status != ApprovalRequestStatus::Pending {
            return Err(ApprovalError::AlreadyDecided(
                row.status.as_str().to_string(),
            ));
        }
        if let Some(expires) = row.link_expires_at {
            if expires < Utc::now() {
                return Err(ApprovalError::Expired);
            }
        }
        Ok(row)
    }

    /// `GET /approval/{token}`: view details.
    pub async fn details(&self, token: &str) -> Result<ApprovalDetails, ApprovalError> {
        let row = self.validated(token).await?;
        let artifact = self.db.get_artifact(&row.artifact_id).await?;
        Ok(ApprovalDetails {
            approval_request_id: row.id.clone(),
            token: token.to_string(),
            status: row.status,
            artifact: json!({
                "id": artifact.id,
                "filename": artifact.original_filename,
                "file_type": artifact.file_type,
                "version": artifact.version,
                "view_url": row.view_url,
            }),
            generation_info: json!({
                "step_id": row.step_id,
                "workflow_name": row.config_metadata.get("workflow_name"),
                "server": row.config_metadata.get("server"),
                "parameters_used": row.config_metadata.get("parameters"),
                "approval_policy": row.config_metadata.get("approval_policy"),
            }),
            expires_at: row.link_expires_at.map(|t| t.to_rfc3339()),
        })
    }

    /// `GET /approval/{token}/parameters`: the editable schema plus the
    /// values the artifact was generated with.
    pub async fn editable_parameters(&self, token: &str) -> Result<Value, ApprovalError> {
        let row = self.validated(token).await?;
        let workflow_name = row
            .config_metadata
            .get("workflow_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let schema: BTreeMap<String, &rp_registry::WorkflowParameter> = self
            .registry
            .parameters(&workflow_name)
            .unwrap_or_default()
            .iter()
            .map(|p| (p.key.clone(), p))
            .collect();
        Ok(json!({
            "workflow_name": workflow_name,
            "server": row.config_metadata.get("server"),
            "current_parameters": row.config_metadata.get("parameters"),
            "parameter_schema": schema,
            "editable_parameters": schema.keys().collect::<Vec<_>>(),
        }))
    }

    /// `POST /approval/{token}/approve`: flip the row, stamp the artifact,
    /// signal the chain.
    pub async fn approve(&self, token: &str, decided_by: &str) -> Result<Value, ApprovalError> {
        let row = self.validated(token).await?;
        let row = self
            .db
            .decide_approval(&row.id, ApprovalRequestStatus::Approved, Some(decided_by))
            .await?;
        self.db
            .set_artifact_approval(
                &row.artifact_id,
                rp_core::ArtifactApprovalStatus::Approved,
                Some(decided_by),
                None,
            )
            .await?;
        self.signal(
            &row,
            ApprovalDecision {
                decision: ApprovalDecision::APPROVED.to_string(),
                decided_by: decided_by.to_string(),
                parameters: BTreeMap::new(),
                comment: None,
            },
        )
        .await?;
        info!(approval_id = %row.id, decided_by, "artifact approved");
        Ok(json!({
            "status": "approved",
            "approval_request_id": row.id,
            "decided_by": decided_by,
        }))
    }

    /// `POST /approval/{token}/reject`: validate the replacement
    /// parameters against the override contract, flip the row, signal.
    pub async fn reject(
        &self,
        token: &str,
        decided_by: &str,
        parameters: BTreeMap<String, Value>,
        rejection_comment: Option<String>,
    ) -> Result<Value, ApprovalError> {
        let row = self.validated(token).await?;
        let workflow_name = row
            .config_metadata
            .get("workflow_name")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let issues = validate_parameters(&self.registry, workflow_name, &parameters);
        if !issues.is_empty() {
            return Err(ApprovalError::InvalidParameters(issues));
        }

        let row = self
            .db
            .decide_approval(&row.id, ApprovalRequestStatus::Rejected, Some(decided_by))
            .await?;
        self.db
            .set_artifact_approval(
                &row.artifact_id,
                rp_core::ArtifactApprovalStatus::Rejected,
                Some(decided_by),
                rejection_comment.as_deref(),
            )
            .await?;
        self.signal(
            &row,
            ApprovalDecision {
                decision: ApprovalDecision::REJECTED.to_string(),
                decided_by: decided_by.to_string(),
                parameters: parameters.clone(),
                comment: rejection_comment,
            },
        )
        .await?;
        info!(approval_id = %row.id, decided_by, "artifact rejected");
        Ok(json!({
            "status": "rejected",
            "approval_request_id": row.id,
            "decided_by": decided_by,
            "regenerating_with_parameters": parameters,
        }))
    }

    async fn signal(
        &self,
        row: &ApprovalRequestRow,
        decision: ApprovalDecision,
    ) -> Result<(), ApprovalError> {
        let name = approval_signal_name(row.step_id.as_deref());
        let payload = serde_json::to_value(&decision)
            .map_err(|e| ApprovalError::Signal(e.to_string()))?;
        self.engine
            .signal(&row.engine_workflow_id, &name, payload)
            .await
            .map_err(|e| {
                warn!(workflow_id = %row.engine_workflow_id, error = %e, "approval signal failed");
                ApprovalError::Signal(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_db::{NewArtifact, NewJob};
    use rp_engine::InMemoryHistoryStore;

    #[test]
    fn tokens_are_long_urlsafe_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        // 32 bytes -> 43 unpadded base64 chars.
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    async fn service_with_artifact() -> (ApprovalService, String) {
        let db = MetadataStore::open_in_memory().await.unwrap();
        let job = db
            .create_job(NewJob {
                workflow_name: "tiny".into(),
                backend_address: "http://gpu-1:8188".into(),
                ..NewJob::default()
            })
            .await
            .unwrap();
        let artifact = db
            .create_artifact(NewArtifact {
                job_id: job.id.clone(),
                original_filename: "out.png".into(),
                local_filename: "abcd1234.png".into(),
                local_path: "/artifacts/abcd1234.png".into(),
                file_type: rp_core::MediaKind::Image,
                file_format: Some("png".into()),
                file_size: Some(10),
                node_id: Some("9".into()),
                subfolder: String::new(),
                backend_folder_kind: "output".into(),
                parent_artifact_id: None,
                approval_status: rp_core::ArtifactApprovalStatus::Pending,
                metadata: None,
            })
            .await
            .unwrap();
        let engine = Engine::new(Arc::new(InMemoryHistoryStore::new()));
        let service = ApprovalService::new(db, Arc::new(TemplateRegistry::empty()), engine);
        (service, artifact.id)
    }

    #[tokio::test]
    async fn approve_flow_revokes_token() {
        let (service, artifact_id) = service_with_artifact().await;
        let row = service
            .create_request(
                &artifact_id,
                "wf-chain",
                None,
                None,
                Some("stepA"),
                "http://localhost:8080",
                168,
                json!({"workflow_name": "tiny"}),
            )
            .await
            .unwrap();

        let details = service.details(&row.token).await.unwrap();
        assert_eq!(details.status, ApprovalRequestStatus::Pending);
        assert!(details.expires_at.is_some());

        let result = service.approve(&row.token, "qa@example").await.unwrap();
        assert_eq!(result["status"], "approved");

        // Token is single-use.
        let err = service.approve(&row.token, "qa@example").await.unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyDecided(_)));
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let (service, _) = service_with_artifact().await;
        assert!(matches!(
            service.details("no-such-token").await.unwrap_err(),
            ApprovalError::TokenNotFound
        ));
    }

    #[tokio::test]
    async fn expired_link_rejected() {
        let (service, artifact_id) = service_with_artifact().await;
        // TTL of -1 hour: already expired.
        let row = service
            .create_request(
                &artifact_id,
                "wf-chain",
                None,
                None,
                None,
                "http://localhost:8080",
                -1,
                json!({}),
            )
            .await
            .unwrap();
        assert!(matches!(
            service.approve(&row.token, "qa").await.unwrap_err(),
            ApprovalError::Expired
        ));
    }

    #[tokio::test]
    async fn reject_validates_parameters_against_registry() {
        let (service, artifact_id) = service_with_artifact().await;
        let row = service
            .create_request(
                &artifact_id,
                "wf-chain",
                None,
                None,
                Some("stepA"),
                "http://localhost:8080",
                168,
                json!({"workflow_name": "tiny"}),
            )
            .await
            .unwrap();

        // Empty registry: every key is uneditable.
        let mut params = BTreeMap::new();
        params.insert("3.seed".to_string(), json!(42));
        let err = service
            .reject(&row.token, "qa", params, Some("wrong vibe".into()))
            .await
            .unwrap_err();
        match err {
            ApprovalError::InvalidParameters(issues) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].key, "3.seed");
            }
            other => panic!("expected InvalidParameters, got {other:?}"),
        }

        // The failed validation must not consume the token.
        let ok = service.reject(&row.token, "qa", BTreeMap::new(), None).await;
        assert!(ok.is_ok());
    }
}
