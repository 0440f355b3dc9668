//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use cineweave_core::{JobId, UserId};
use cineweave_jobs::{ArtifactRef, ExternalJobId, Job, JobStatus};

/// Job store abstraction.
///
/// Status changes are conditional: each `mark_*` applies only if the job is
/// still in a state the transition allows, and returns `Ok(None)` otherwise.
/// That conditional write is what makes duplicate callbacks harmless.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job if the owner has fewer than `max_active` queued or
    /// running jobs. The count and the insert are one atomic step.
    async fn admit(&self, job: Job, max_active: usize) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn find_by_external_id(
        &self,
        external_id: &ExternalJobId,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Most recent first.
    async fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// One page of failed jobs in id (creation) order, starting after
    /// `after`. Pass the last id of a page to get the next one.
    async fn list_failed(
        &self,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// `queued -> running`, recording the backend's id.
    async fn mark_running(
        &self,
        job_id: JobId,
        external_id: ExternalJobId,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `running -> done`, recording the artifact and its retention deadline.
    async fn mark_done(
        &self,
        job_id: JobId,
        artifact: ArtifactRef,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Any non-terminal state `-> failed`.
    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<Option<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("concurrency limit reached: {active} of {limit} jobs active")]
    ConcurrencyLimit { active: usize, limit: usize },
    #[error("external job id already recorded: {0}")]
    DuplicateExternalId(ExternalJobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

/// Apply a domain transition; an illegal transition leaves the job untouched.
fn apply_transition<F>(
    jobs: &mut HashMap<JobId, Job>,
    job_id: JobId,
    f: F,
) -> Result<Option<Job>, JobStoreError>
where
    F: FnOnce(&mut Job) -> bool,
{
    let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
    let mut candidate = job.clone();
    if !f(&mut candidate) {
        return Ok(None);
    }
    *job = candidate.clone();
    Ok(Some(candidate))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn admit(&self, job: Job, max_active: usize) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let active = jobs
            .values()
            .filter(|j| j.user_id == job.user_id && j.status.is_active())
            .count();
        if active >= max_active {
            return Err(JobStoreError::ConcurrencyLimit {
                active,
                limit: max_active,
            });
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn find_by_external_id(
        &self,
        external_id: &ExternalJobId,
    ) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .read()?
            .values()
            .find(|j| j.external_job_id.as_ref() == Some(external_id))
            .cloned())
    }

    async fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();

        // Ids are time-ordered, which breaks ties between equal timestamps.
        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_failed(
        &self,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed && after.is_none_or(|a| j.id > a))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.id);
        result.truncate(limit);
        Ok(result)
    }

    async fn mark_running(
        &self,
        job_id: JobId,
        external_id: ExternalJobId,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs
            .values()
            .any(|j| j.id != job_id && j.external_job_id.as_ref() == Some(&external_id))
        {
            return Err(JobStoreError::DuplicateExternalId(external_id));
        }
        apply_transition(&mut jobs, job_id, |job| {
            job.mark_running(external_id, Utc::now()).is_ok()
        })
    }

    async fn mark_done(
        &self,
        job_id: JobId,
        artifact: ArtifactRef,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        apply_transition(&mut jobs, job_id, |job| {
            job.mark_done(artifact, Utc::now()).is_ok()
        })
    }

    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        apply_transition(&mut jobs, job_id, |job| {
            job.mark_failed(error, Utc::now()).is_ok()
        })
    }
}
