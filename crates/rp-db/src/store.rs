// SPDX-License-Identifier: MIT OR Apache-2.0
//! The store and its operations.

use crate::rows::{
    approval_from_row, artifact_from_row, chain_from_row, job_from_row, json_text,
    transfer_from_row,
};
use crate::{
    ApprovalRequestRow, ArtifactRow, ChainRow, JobRow, MetadataStoreError, NewApprovalRequest,
    NewArtifact, NewChain, NewJob, NewTransfer, Result, TransferRow,
};
use chrono::Utc;
use rp_core::{ApprovalRequestStatus, ChainStatus, JobStatus, TransferStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chains (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    engine_workflow_id TEXT UNIQUE,
    engine_run_id TEXT,
    status TEXT NOT NULL,
    current_level INTEGER NOT NULL DEFAULT 0,
    definition TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chains_status ON chains(status);
CREATE INDEX IF NOT EXISTS idx_chains_started ON chains(started_at);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    chain_id TEXT REFERENCES chains(id) ON DELETE CASCADE,
    step_id TEXT,
    workflow_name TEXT NOT NULL,
    backend_address TEXT NOT NULL,
    backend_prompt_id TEXT,
    engine_workflow_id TEXT,
    engine_run_id TEXT,
    status TEXT NOT NULL,
    latest_artifact_id TEXT REFERENCES artifacts(id) ON DELETE SET NULL,
    definition TEXT,
    parameters TEXT,
    queued_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_chain_step
    ON jobs(chain_id, step_id)
    WHERE chain_id IS NOT NULL AND step_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_jobs_prompt ON jobs(backend_address, backend_prompt_id);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_engine ON jobs(engine_workflow_id);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    original_filename TEXT NOT NULL,
    local_filename TEXT NOT NULL UNIQUE,
    local_path TEXT NOT NULL UNIQUE,
    file_type TEXT NOT NULL,
    file_format TEXT,
    file_size INTEGER,
    node_id TEXT,
    subfolder TEXT NOT NULL DEFAULT '',
    backend_folder_kind TEXT NOT NULL DEFAULT 'output',
    version INTEGER NOT NULL DEFAULT 1,
    is_latest INTEGER NOT NULL DEFAULT 1,
    parent_artifact_id TEXT REFERENCES artifacts(id) ON DELETE SET NULL,
    approval_status TEXT NOT NULL DEFAULT 'auto_approved',
    approver TEXT,
    decided_at TEXT,
    rejection_reason TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_job ON artifacts(job_id);
CREATE INDEX IF NOT EXISTS idx_artifacts_latest ON artifacts(job_id, is_latest);
CREATE INDEX IF NOT EXISTS idx_artifacts_approval ON artifacts(approval_status);
CREATE INDEX IF NOT EXISTS idx_artifacts_created ON artifacts(created_at);

CREATE TABLE IF NOT EXISTS artifact_transfers (
    id TEXT PRIMARY KEY,
    artifact_id TEXT NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
    source_job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    target_job_id TEXT REFERENCES jobs(id) ON DELETE CASCADE,
    target_backend TEXT NOT NULL,
    target_subfolder TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    uploaded_at TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transfers_artifact ON artifact_transfers(artifact_id);
CREATE INDEX IF NOT EXISTS idx_transfers_source ON artifact_transfers(source_job_id);
CREATE INDEX IF NOT EXISTS idx_transfers_status ON artifact_transfers(status);

CREATE TABLE IF NOT EXISTS approval_requests (
    id TEXT PRIMARY KEY,
    artifact_id TEXT NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
    chain_id TEXT REFERENCES chains(id) ON DELETE CASCADE,
    step_id TEXT,
    engine_workflow_id TEXT NOT NULL,
    engine_run_id TEXT,
    token TEXT NOT NULL UNIQUE,
    view_url TEXT NOT NULL,
    link_expires_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    decided_by TEXT,
    decided_at TEXT,
    config_metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_approvals_token ON approval_requests(token);
CREATE INDEX IF NOT EXISTS idx_approvals_artifact ON approval_requests(artifact_id);
CREATE INDEX IF NOT EXISTS idx_approvals_chain ON approval_requests(chain_id);
CREATE INDEX IF NOT EXISTS idx_approvals_status ON approval_requests(status);

CREATE TABLE IF NOT EXISTS submit_intents (
    id TEXT PRIMARY KEY,
    backend_address TEXT NOT NULL,
    prompt_id TEXT,
    created_at TEXT NOT NULL
);
"#;

/// Handle to the metadata database.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (and migrate) the database at `url`
    /// (e.g. `sqlite:///var/lib/renderplane/meta.db`).
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(url, "metadata store opened");
        Ok(store)
    }

    /// In-memory database for tests; single connection so the memory DB is
    /// shared.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chains
    // -----------------------------------------------------------------------

    /// Create a chain row in `initializing`.
    pub async fn create_chain(&self, new: NewChain) -> Result<ChainRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO chains (id, name, description, engine_workflow_id, engine_run_id, \
             status, current_level, definition, started_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.engine_workflow_id)
        .bind(&new.engine_run_id)
        .bind(ChainStatus::Initializing.as_string())
        .bind(json_text(&new.definition))
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        debug!(chain_id = %id, name = %new.name, "chain created");
        self.get_chain(&id).await
    }

    /// Fetch a chain by id.
    pub async fn get_chain(&self, id: &str) -> Result<ChainRow> {
        let row = sqlx::query("SELECT * FROM chains WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataStoreError::NotFound {
                entity: "chain",
                id: id.to_string(),
            })?;
        chain_from_row(&row)
    }

    /// Advance a chain's status. Terminal statuses stamp `completed_at`;
    /// illegal transitions (terminal → anything, level going backwards) are
    /// rejected.
    pub async fn update_chain_status(
        &self,
        id: &str,
        status: ChainStatus,
        current_level: Option<i64>,
        error_message: Option<&str>,
    ) -> Result<ChainRow> {
        let chain = self.get_chain(id).await?;
        if !chain.status.can_transition_to(status) {
            return Err(MetadataStoreError::InvalidTransition {
                entity: "chain",
                from: chain.status.as_string(),
                to: status.as_string(),
            });
        }
        let now = Utc::now();
        let completed_at = status.is_terminal().then_some(now);
        sqlx::query(
            "UPDATE chains SET status = ?, current_level = COALESCE(?, current_level), \
             error_message = COALESCE(?, error_message), completed_at = COALESCE(?, completed_at), \
             updated_at = ? WHERE id = ?",
        )
        .bind(status.as_string())
        .bind(current_level)
        .bind(error_message)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_chain(id).await
    }

    /// Chains, optionally filtered by stored status string.
    pub async fn list_chains(&self, status: Option<&str>) -> Result<Vec<ChainRow>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM chains WHERE status = ? ORDER BY started_at DESC")
                    .bind(status)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM chains ORDER BY started_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(chain_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Create a job row in `queued`.
    pub async fn create_job(&self, new: NewJob) -> Result<JobRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO jobs (id, chain_id, step_id, workflow_name, backend_address, \
             engine_workflow_id, engine_run_id, status, definition, parameters, \
             queued_at, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.chain_id)
        .bind(&new.step_id)
        .bind(&new.workflow_name)
        .bind(&new.backend_address)
        .bind(&new.engine_workflow_id)
        .bind(&new.engine_run_id)
        .bind(JobStatus::Queued.as_str())
        .bind(json_text(&new.definition))
        .bind(json_text(&new.parameters))
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        debug!(job_id = %id, workflow = %new.workflow_name, "job created");
        self.get_job(&id).await
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: &str) -> Result<JobRow> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataStoreError::NotFound {
                entity: "job",
                id: id.to_string(),
            })?;
        job_from_row(&row)
    }

    /// Record the backend's prompt id once submission succeeded.
    pub async fn set_job_prompt_id(&self, id: &str, prompt_id: &str) -> Result<JobRow> {
        sqlx::query("UPDATE jobs SET backend_prompt_id = ?, updated_at = ? WHERE id = ?")
            .bind(prompt_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get_job(id).await
    }

    /// Advance a job's status, stamping `started_at`/`completed_at` as the
    /// lifecycle requires. Illegal transitions are rejected; writing the
    /// current status again is a no-op.
    pub async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<JobRow> {
        let job = self.get_job(id).await?;
        if job.status == status {
            return Ok(job);
        }
        if !job.status.can_transition_to(status) {
            return Err(MetadataStoreError::InvalidTransition {
                entity: "job",
                from: job.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        let now = Utc::now();
        let started_at = (status == JobStatus::Executing).then_some(now);
        let completed_at = status.is_terminal().then_some(now);
        sqlx::query(
            "UPDATE jobs SET status = ?, error_message = COALESCE(?, error_message), \
             started_at = COALESCE(?, started_at), completed_at = COALESCE(?, completed_at), \
             updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(started_at)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_job(id).await
    }

    /// Jobs, optionally filtered by chain and/or stored status string.
    pub async fn list_jobs(
        &self,
        chain_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<JobRow>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE (? IS NULL OR chain_id = ?) \
             AND (? IS NULL OR status = ?) ORDER BY queued_at DESC",
        )
        .bind(chain_id)
        .bind(chain_id)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// The job row for one chain step, if it exists. `(chain_id, step_id)`
    /// is unique, so regeneration attempts find and reuse the original row.
    pub async fn find_chain_job(&self, chain_id: &str, step_id: &str) -> Result<Option<JobRow>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE chain_id = ? AND step_id = ?")
            .bind(chain_id)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// The job holding `(backend_address, backend_prompt_id)`; the external
    /// id space is only unique per backend, so lookups always pass both.
    pub async fn find_job_by_prompt(
        &self,
        backend_address: &str,
        prompt_id: &str,
    ) -> Result<Option<JobRow>> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE backend_address = ? AND backend_prompt_id = ?",
        )
        .bind(backend_address)
        .bind(prompt_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    /// Insert an artifact as the job's new latest, atomically unsetting
    /// `is_latest` on its siblings and repointing `latest_artifact_id`.
    /// With `parent_artifact_id` set, the version is `parent.version + 1`
    /// and the parent must belong to the same job.
    pub async fn create_artifact(&self, new: NewArtifact) -> Result<ArtifactRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let version: i64 = match &new.parent_artifact_id {
            None => 1,
            Some(parent_id) => {
                let parent = sqlx::query("SELECT job_id, version FROM artifacts WHERE id = ?")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataStoreError::NotFound {
                        entity: "artifact",
                        id: parent_id.clone(),
                    })?;
                let parent_job: String = sqlx::Row::try_get(&parent, "job_id")?;
                if parent_job != new.job_id {
                    return Err(MetadataStoreError::Corrupt(format!(
                        "parent artifact {parent_id} belongs to job {parent_job}, not {}",
                        new.job_id
                    )));
                }
                let parent_version: i64 = sqlx::Row::try_get(&parent, "version")?;
                parent_version + 1
            }
        };

        sqlx::query("UPDATE artifacts SET is_latest = 0, updated_at = ? WHERE job_id = ?")
            .bind(now)
            .bind(&new.job_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO artifacts (id, job_id, original_filename, local_filename, local_path, \
             file_type, file_format, file_size, node_id, subfolder, backend_folder_kind, \
             version, is_latest, parent_artifact_id, approval_status, metadata, \
             created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.job_id)
        .bind(&new.original_filename)
        .bind(&new.local_filename)
        .bind(&new.local_path)
        .bind(new.file_type.as_str())
        .bind(&new.file_format)
        .bind(new.file_size)
        .bind(&new.node_id)
        .bind(&new.subfolder)
        .bind(&new.backend_folder_kind)
        .bind(version)
        .bind(&new.parent_artifact_id)
        .bind(new.approval_status.as_str())
        .bind(json_text(&new.metadata))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE jobs SET latest_artifact_id = ?, updated_at = ? WHERE id = ?")
            .bind(&id)
            .bind(now)
            .bind(&new.job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(artifact_id = %id, job_id = %new.job_id, version, "artifact created");
        self.get_artifact(&id).await
    }

    /// Fetch an artifact by id.
    pub async fn get_artifact(&self, id: &str) -> Result<ArtifactRow> {
        let row = sqlx::query("SELECT * FROM artifacts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataStoreError::NotFound {
                entity: "artifact",
                id: id.to_string(),
            })?;
        artifact_from_row(&row)
    }

    /// The unique `is_latest` artifact of a job, if any exist.
    pub async fn get_latest_artifact(&self, job_id: &str) -> Result<Option<ArtifactRow>> {
        let row = sqlx::query("SELECT * FROM artifacts WHERE job_id = ? AND is_latest = 1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    /// A job's artifacts; latest-only unless `include_old`.
    pub async fn list_artifacts(&self, job_id: &str, include_old: bool) -> Result<Vec<ArtifactRow>> {
        let rows = if include_old {
            sqlx::query("SELECT * FROM artifacts WHERE job_id = ? ORDER BY version DESC")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query(
                "SELECT * FROM artifacts WHERE job_id = ? AND is_latest = 1 ORDER BY version DESC",
            )
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(artifact_from_row).collect()
    }

    /// All versions reachable from an artifact by walking
    /// `parent_artifact_id`, newest first.
    pub async fn artifact_versions(&self, artifact_id: &str) -> Result<Vec<ArtifactRow>> {
        let mut versions = vec![self.get_artifact(artifact_id).await?];
        while let Some(parent_id) = versions.last().and_then(|a| a.parent_artifact_id.clone()) {
            match self.get_artifact(&parent_id).await {
                Ok(parent) => versions.push(parent),
                Err(MetadataStoreError::NotFound { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    /// Stamp an approval disposition onto an artifact row. `decided_at` is
    /// only set for actual decisions, not when the gate flips the artifact
    /// to pending.
    pub async fn set_artifact_approval(
        &self,
        id: &str,
        status: rp_core::ArtifactApprovalStatus,
        approver: Option<&str>,
        rejection_reason: Option<&str>,
    ) -> Result<ArtifactRow> {
        let now = Utc::now();
        let decided_at =
            (status != rp_core::ArtifactApprovalStatus::Pending).then_some(now);
        sqlx::query(
            "UPDATE artifacts SET approval_status = ?, approver = ?, decided_at = ?, \
             rejection_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(approver)
        .bind(decided_at)
        .bind(rejection_reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_artifact(id).await
    }

    /// Local filenames referenced by any artifact row; the sweep's keep set.
    pub async fn referenced_local_filenames(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT local_filename FROM artifacts")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| sqlx::Row::try_get::<String, _>(r, "local_filename").map_err(Into::into))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------------

    /// Create a transfer row in `pending`.
    pub async fn create_transfer(&self, new: NewTransfer) -> Result<TransferRow> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO artifact_transfers (id, artifact_id, source_job_id, target_job_id, \
             target_backend, target_subfolder, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.artifact_id)
        .bind(&new.source_job_id)
        .bind(&new.target_job_id)
        .bind(&new.target_backend)
        .bind(&new.target_subfolder)
        .bind(TransferStatus::Pending.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_transfer(&id).await
    }

    /// Fetch a transfer by id.
    pub async fn get_transfer(&self, id: &str) -> Result<TransferRow> {
        let row = sqlx::query("SELECT * FROM artifact_transfers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataStoreError::NotFound {
                entity: "transfer",
                id: id.to_string(),
            })?;
        transfer_from_row(&row)
    }

    /// Advance a transfer's status; `completed` stamps `uploaded_at`.
    pub async fn update_transfer_status(
        &self,
        id: &str,
        status: TransferStatus,
        error_message: Option<&str>,
    ) -> Result<TransferRow> {
        let uploaded_at = (status == TransferStatus::Completed).then(Utc::now);
        sqlx::query(
            "UPDATE artifact_transfers SET status = ?, uploaded_at = COALESCE(?, uploaded_at), \
             error_message = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(uploaded_at)
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_transfer(id).await
    }

    /// Transfers recorded for one artifact, newest first.
    pub async fn list_transfers_for_artifact(&self, artifact_id: &str) -> Result<Vec<TransferRow>> {
        let rows = sqlx::query(
            "SELECT * FROM artifact_transfers WHERE artifact_id = ? ORDER BY created_at DESC",
        )
        .bind(artifact_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transfer_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Approval requests
    // -----------------------------------------------------------------------

    /// Create a pending approval request with a caller-generated token.
    pub async fn create_approval_request(
        &self,
        new: NewApprovalRequest,
    ) -> Result<ApprovalRequestRow> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO approval_requests (id, artifact_id, chain_id, step_id, \
             engine_workflow_id, engine_run_id, token, view_url, link_expires_at, status, \
             config_metadata, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&id)
        .bind(&new.artifact_id)
        .bind(&new.chain_id)
        .bind(&new.step_id)
        .bind(&new.engine_workflow_id)
        .bind(&new.engine_run_id)
        .bind(&new.token)
        .bind(&new.view_url)
        .bind(new.link_expires_at)
        .bind(new.config_metadata.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        debug!(approval_id = %id, artifact_id = %new.artifact_id, "approval request created");
        self.get_approval_request(&id).await
    }

    /// Fetch an approval request by id.
    pub async fn get_approval_request(&self, id: &str) -> Result<ApprovalRequestRow> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataStoreError::NotFound {
                entity: "approval request",
                id: id.to_string(),
            })?;
        approval_from_row(&row)
    }

    /// Look up by token.
    pub async fn get_approval_by_token(&self, token: &str) -> Result<Option<ApprovalRequestRow>> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(approval_from_row).transpose()
    }

    /// Latest request for an artifact.
    pub async fn get_approval_by_artifact(
        &self,
        artifact_id: &str,
    ) -> Result<Option<ApprovalRequestRow>> {
        let row = sqlx::query(
            "SELECT * FROM approval_requests WHERE artifact_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(artifact_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(approval_from_row).transpose()
    }

    /// All requests for a chain, newest first.
    pub async fn list_approvals_for_chain(&self, chain_id: &str) -> Result<Vec<ApprovalRequestRow>> {
        let rows = sqlx::query(
            "SELECT * FROM approval_requests WHERE chain_id = ? ORDER BY created_at DESC",
        )
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(approval_from_row).collect()
    }

    /// Flip a pending request to a terminal status. The guarded UPDATE makes
    /// the decision single-shot: a second decision on the same token loses
    /// the race and gets `InvalidTransition`.
    pub async fn decide_approval(
        &self,
        id: &str,
        status: ApprovalRequestStatus,
        decided_by: Option<&str>,
    ) -> Result<ApprovalRequestRow> {
        if !status.is_terminal() {
            return Err(MetadataStoreError::InvalidTransition {
                entity: "approval request",
                from: "pending".to_string(),
                to: status.as_str().to_string(),
            });
        }
        let result = sqlx::query(
            "UPDATE approval_requests SET status = ?, decided_by = ?, decided_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(decided_by)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let current = self.get_approval_request(id).await?;
            return Err(MetadataStoreError::InvalidTransition {
                entity: "approval request",
                from: current.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        self.get_approval_request(id).await
    }

    // -----------------------------------------------------------------------
    // Submit intents
    // -----------------------------------------------------------------------

    /// Record intent to submit before the backend call. Returns the prompt
    /// id already recorded under this intent, if a prior attempt got that
    /// far; double-submission guard for activity retries.
    pub async fn record_submit_intent(
        &self,
        intent_id: &str,
        backend_address: &str,
    ) -> Result<Option<String>> {
        let existing =
            sqlx::query("SELECT prompt_id FROM submit_intents WHERE id = ?")
                .bind(intent_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(row) = existing {
            return Ok(sqlx::Row::try_get(&row, "prompt_id")?);
        }
        sqlx::query(
            "INSERT INTO submit_intents (id, backend_address, created_at) VALUES (?, ?, ?)",
        )
        .bind(intent_id)
        .bind(backend_address)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(None)
    }

    /// Attach the backend's prompt id to a recorded intent.
    pub async fn fulfil_submit_intent(&self, intent_id: &str, prompt_id: &str) -> Result<()> {
        sqlx::query("UPDATE submit_intents SET prompt_id = ? WHERE id = ?")
            .bind(prompt_id)
            .bind(intent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
