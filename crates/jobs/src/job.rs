//! Job record and status machine.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use cineweave_core::{DomainError, DomainResult, JobId, UserId};

use crate::artifact::{ArtifactRef, ExternalJobId};
use crate::request::JobRequest;

/// How long a finished artifact is retained after completion.
pub const ARTIFACT_RETENTION_HOURS: i64 = 24;

pub fn artifact_retention() -> Duration {
    Duration::hours(ARTIFACT_RETENTION_HOURS)
}

/// Job execution status.
///
/// Moves forward only: `queued -> running -> {done | failed}`, and a queued
/// job may fail directly (reservation or submission failure).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Queued or running jobs count against the per-user concurrency cap.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// One video generation request and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub prompt: String,
    pub image_url: Option<String>,
    pub duration_sec: u32,
    pub seed: Option<i64>,
    pub cfg: f64,
    /// Fixed at creation from the requested duration.
    pub credits_used: i64,
    pub status: JobStatus,
    pub external_job_id: Option<ExternalJobId>,
    pub artifact_ref: Option<ArtifactRef>,
    pub error_message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A new queued job for a validated request.
    pub fn new(user_id: UserId, request: &JobRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            user_id,
            prompt: request.prompt.clone(),
            image_url: request.image_url.clone(),
            duration_sec: request.duration.secs(),
            seed: request.seed,
            cfg: request.cfg,
            credits_used: request.credit_cost(),
            status: JobStatus::Queued,
            external_job_id: None,
            artifact_ref: None,
            error_message: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::illegal_transition(
                self.status.as_str(),
                next.as_str(),
            ));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Submission accepted by the compute backend.
    pub fn mark_running(&mut self, external: ExternalJobId, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Running, now)?;
        self.external_job_id = Some(external);
        Ok(())
    }

    /// Completed with an artifact; starts the retention window.
    pub fn mark_done(&mut self, artifact: ArtifactRef, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Done, now)?;
        self.artifact_ref = Some(artifact);
        self.expires_at = Some(now + artifact_retention());
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Failed, now)?;
        self.error_message = Some(error.into());
        Ok(())
    }
}
