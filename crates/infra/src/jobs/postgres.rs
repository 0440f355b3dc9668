//! Postgres-backed job store.
//!
//! ## Admission
//!
//! `admit` takes a transaction-scoped advisory lock keyed by the user id, then
//! counts active jobs and inserts. Concurrent admissions for one user are
//! serialized, so the cap holds even across replicas.
//!
//! ## Transitions
//!
//! Each `mark_*` is a single `UPDATE ... WHERE status IN (...)`. Zero rows
//! updated means the job was missing or already past that state.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation on `id`) | `23505` | `AlreadyExists` | Job id reused |
//! | Database (unique violation on `external_job_id`) | `23505` | `DuplicateExternalId` | Backend id reused |
//! | Database (other) | Any other | `Storage` | Constraint or server errors |
//! | Other | N/A | `Storage` | Pool closed, network errors, etc. |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use cineweave_core::{JobId, UserId};
use cineweave_jobs::{ArtifactRef, ExternalJobId, Job, JobStatus, artifact_retention};

use super::store::{JobStore, JobStoreError};

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Distinguish "no such job" from "transition not allowed" after a
    /// conditional update touched no rows.
    async fn not_applied(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_exists", e))?;
        match exists {
            Some(_) => Ok(None),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }
}

const JOB_COLUMNS: &str = "id, user_id, prompt, image_url, duration_sec, seed, cfg, credits_used, \
     status, external_job_id, artifact_ref, error_message, expires_at, created_at, updated_at";

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    user_id: Uuid,
    prompt: String,
    image_url: Option<String>,
    duration_sec: i32,
    seed: Option<i64>,
    cfg: f64,
    credits_used: i64,
    status: String,
    external_job_id: Option<String>,
    artifact_ref: Option<String>,
    error_message: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |e: cineweave_core::DomainError| JobStoreError::Storage(e.to_string());
        Ok(Job {
            id: JobId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            prompt: row.prompt,
            image_url: row.image_url,
            duration_sec: u32::try_from(row.duration_sec)
                .map_err(|e| JobStoreError::Storage(format!("invalid duration_sec: {e}")))?,
            seed: row.seed,
            cfg: row.cfg,
            credits_used: row.credits_used,
            status: row.status.parse::<JobStatus>().map_err(corrupt)?,
            external_job_id: row.external_job_id.map(ExternalJobId::new).transpose().map_err(corrupt)?,
            artifact_ref: row.artifact_ref.map(ArtifactRef::new).transpose().map_err(corrupt)?,
            error_message: row.error_message,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn unique_constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

fn rows_into(rows: Vec<JobRow>) -> Result<Vec<Job>, JobStoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, user_id = %job.user_id), err)]
    async fn admit(&self, job: Job, max_active: usize) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(job.user_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("admission_lock", e))?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE user_id = $1 AND status IN ('queued', 'running')",
        )
        .bind(job.user_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("count_active", e))?;

        let active = usize::try_from(active).unwrap_or(usize::MAX);
        if active >= max_active {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::ConcurrencyLimit {
                active,
                limit: max_active,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO jobs (id, user_id, prompt, image_url, duration_sec, seed, cfg, credits_used,
                              status, external_job_id, artifact_ref, error_message, expires_at,
                              created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, NULL, NULL, NULL, $10, $11)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(&job.prompt)
        .bind(&job.image_url)
        .bind(i32::try_from(job.duration_sec).unwrap_or(i32::MAX))
        .bind(job.seed)
        .bind(job.cfg)
        .bind(job.credits_used)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match unique_constraint(&e) {
            Some(_) => JobStoreError::AlreadyExists(job.id),
            None => map_sqlx_error("insert_job", e),
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(job_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(external_job_id = %external_id), err)]
    async fn find_by_external_id(
        &self,
        external_id: &ExternalJobId,
    ) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE external_job_id = $1"
        ))
        .bind(external_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_external_id", e))?;
        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(user_id.as_uuid())
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_user", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), err)]
    async fn list_failed(
        &self,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'failed' AND ($1::uuid IS NULL OR id > $1) \
             ORDER BY id ASC LIMIT $2"
        ))
        .bind(after.map(|id| *id.as_uuid()))
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_failed", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), fields(job_id = %job_id, external_job_id = %external_id), err)]
    async fn mark_running(
        &self,
        job_id: JobId,
        external_id: ExternalJobId,
    ) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs SET status = 'running', external_job_id = $2, updated_at = $3
            WHERE id = $1 AND status = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(external_id.as_str())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| match unique_constraint(&e) {
            Some(_) => JobStoreError::DuplicateExternalId(external_id.clone()),
            None => map_sqlx_error("mark_running", e),
        })?;

        match row {
            Some(row) => Job::try_from(row).map(Some),
            None => self.not_applied(job_id).await,
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_done(
        &self,
        job_id: JobId,
        artifact: ArtifactRef,
    ) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs SET status = 'done', artifact_ref = $2, expires_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(artifact.as_str())
        .bind(now + artifact_retention())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_done", e))?;

        match row {
            Some(row) => Job::try_from(row).map(Some),
            None => self.not_applied(job_id).await,
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs SET status = 'failed', error_message = $2, updated_at = $3
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(error)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        match row {
            Some(row) => Job::try_from(row).map(Some),
            None => self.not_applied(job_id).await,
        }
    }
}
