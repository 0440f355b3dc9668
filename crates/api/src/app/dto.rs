use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cineweave_core::{JobId, UserId};
use cineweave_credits::{LedgerEntry, Plan, PlanTier};
use cineweave_jobs::{Job, JobRequest, JobStatus};
use cineweave_infra::saga::{CallbackOutcome, JobAdmission};

use crate::app::errors::ApiError;

pub const DEFAULT_JOB_LIMIT: usize = 20;
pub const MAX_JOB_LIMIT: usize = 100;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 200;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub prompt: String,
    pub duration_sec: u32,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub cfg: Option<f64>,
}

impl TryFrom<CreateJobRequest> for JobRequest {
    type Error = ApiError;

    fn try_from(body: CreateJobRequest) -> Result<Self, Self::Error> {
        Ok(JobRequest::new(
            body.prompt,
            body.duration_sec,
            body.image_url,
            body.seed,
            body.cfg,
        )?)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    /// Requested limit, defaulted and capped; zero counts as unset.
    pub fn resolve(&self, default: usize, max: usize) -> usize {
        match self.limit {
            Some(0) | None => default,
            Some(n) => n.min(max),
        }
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub credits_used: i64,
    pub credits_remaining: i64,
}

impl From<JobAdmission> for CreateJobResponse {
    fn from(admission: JobAdmission) -> Self {
        Self {
            job_id: admission.job_id,
            credits_used: admission.credits_used,
            credits_remaining: admission.credits_remaining,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub prompt: String,
    pub duration_sec: u32,
    pub credits_used: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobView {
    pub fn new(job: Job, download_url: Option<String>) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            prompt: job.prompt,
            duration_sec: job.duration_sec,
            credits_used: job.credits_used,
            download_url,
            expires_at: job.expires_at,
            error_message: job.error_message,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsResponse {
    pub credits: i64,
    pub plan: PlanTier,
    pub plan_details: Plan,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditHistoryResponse {
    pub user_id: UserId,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub environment: String,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CallbackAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl From<CallbackOutcome> for CallbackAck {
    fn from(outcome: CallbackOutcome) -> Self {
        Self {
            status: outcome.status(),
            reason: outcome.reason(),
        }
    }
}
