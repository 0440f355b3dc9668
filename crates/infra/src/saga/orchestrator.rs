//! Job admission: cap check, reservation, submission, and compensation.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use cineweave_core::{JobId, UserId};
use cineweave_credits::CreditError;
use cineweave_jobs::{Job, JobRequest};

use crate::credits::{CreditReservationService, CreditStoreError};
use crate::external::{ComputeBackend, SubmitRequest};
use crate::jobs::{JobStore, JobStoreError};

/// Result of a successful `create_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobAdmission {
    pub job_id: JobId,
    pub credits_used: i64,
    pub credits_remaining: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {0} belongs to another user")]
    AccessDenied(JobId),

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("concurrency limit reached: {active} of {limit} jobs active")]
    ConcurrencyLimitExceeded { active: usize, limit: usize },

    #[error("job submission failed: {0}")]
    SubmissionFailed(String),

    #[error(transparent)]
    Credits(#[from] CreditStoreError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

pub struct JobOrchestrator {
    jobs: Arc<dyn JobStore>,
    credits: CreditReservationService,
    compute: Arc<dyn ComputeBackend>,
    max_active: usize,
}

impl JobOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        credits: CreditReservationService,
        compute: Arc<dyn ComputeBackend>,
        max_active: usize,
    ) -> Self {
        Self {
            jobs,
            credits,
            compute,
            max_active,
        }
    }

    /// Admit, bill, and submit a job.
    ///
    /// Every failure after the reservation leaves the job `failed` with its
    /// credits refunded, so the caller's balance is unchanged by a failed call.
    #[instrument(skip_all, fields(user_id = %user_id, duration_sec = request.duration.secs()), err)]
    pub async fn create_job(
        &self,
        user_id: UserId,
        request: JobRequest,
    ) -> Result<JobAdmission, OrchestratorError> {
        self.credits.user(user_id).await.map_err(|e| match e {
            CreditStoreError::UserNotFound(id) => OrchestratorError::UserNotFound(id),
            other => other.into(),
        })?;

        let job = Job::new(user_id, &request, Utc::now());
        let job = self
            .jobs
            .admit(job, self.max_active)
            .await
            .map_err(|e| match e {
                JobStoreError::ConcurrencyLimit { active, limit } => {
                    OrchestratorError::ConcurrencyLimitExceeded { active, limit }
                }
                other => other.into(),
            })?;

        let description = format!("Video generation ({}s)", job.duration_sec);
        let reservation = match self
            .credits
            .reserve(user_id, job.credits_used, job.id, description)
            .await
        {
            Ok(entry) => entry,
            Err(CreditStoreError::Rejected(CreditError::InsufficientCredits {
                required,
                available,
            })) => {
                // Nothing was debited; only the job needs closing.
                self.jobs.mark_failed(job.id, "Insufficient credits").await?;
                return Err(OrchestratorError::InsufficientCredits {
                    required,
                    available,
                });
            }
            Err(e) => {
                self.fail_and_settle(job.id, &format!("Credit reservation failed: {e}"))
                    .await;
                return Err(e.into());
            }
        };

        let external_id = match self.compute.submit(&SubmitRequest::from(&job)).await {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "compute submission failed");
                self.fail_and_settle(job.id, &format!("Submission failed: {e}"))
                    .await;
                return Err(OrchestratorError::SubmissionFailed(e.to_string()));
            }
        };

        match self.jobs.mark_running(job.id, external_id.clone()).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(job_id = %job.id, external_job_id = %external_id, "job left queued before submission was recorded");
            }
            Err(e) => {
                self.fail_and_settle(job.id, &format!("Recording submission failed: {e}"))
                    .await;
                return Err(e.into());
            }
        }

        info!(
            job_id = %job.id,
            external_job_id = %external_id,
            credits_used = job.credits_used,
            "job submitted"
        );

        Ok(JobAdmission {
            job_id: job.id,
            credits_used: job.credits_used,
            credits_remaining: reservation.balance_after,
        })
    }

    /// Fetch a job owned by `user_id`.
    pub async fn get_job(&self, user_id: UserId, job_id: JobId) -> Result<Job, OrchestratorError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        if job.user_id != user_id {
            return Err(OrchestratorError::AccessDenied(job_id));
        }
        Ok(job)
    }

    /// Newest first.
    pub async fn list_jobs(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.jobs.list_for_user(user_id, limit).await?)
    }

    /// Compensation: fail the job, then refund whatever it reserved.
    ///
    /// Errors are logged rather than returned; the caller is already reporting
    /// the original failure and the reconciliation sweep settles leftovers.
    async fn fail_and_settle(&self, job_id: JobId, reason: &str) {
        let failed = match self.jobs.mark_failed(job_id, reason).await {
            Ok(Some(job)) => job,
            Ok(None) => match self.jobs.get(job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to reload job for compensation");
                    return;
                }
            },
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to mark job failed");
                return;
            }
        };

        if let Err(e) = self.credits.settle_failed_job(&failed).await {
            error!(job_id = %job_id, error = %e, "compensating refund failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::CreditStore;
    use crate::saga::testing::{Fixture, StubCompute};
    use cineweave_credits::LedgerEntryKind;
    use cineweave_jobs::JobStatus;

    fn request(duration_sec: u32) -> JobRequest {
        JobRequest::new("a fox in the snow", duration_sec, None, Some(7), None).unwrap()
    }

    #[tokio::test]
    async fn successful_admission_reserves_and_runs() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;

        let admission = fx.orchestrator.create_job(fx.user.id, request(15)).await.unwrap();
        assert_eq!(admission.credits_used, 3);
        assert_eq!(admission.credits_remaining, 7);

        let job = fx.orchestrator.get_job(fx.user.id, admission.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.external_job_id.is_some());

        let entries = fx.credit_store.ledger_for_job(job.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LedgerEntryKind::Reservation);
        assert_eq!(entries[0].description, "Video generation (15s)");
    }

    #[tokio::test]
    async fn unknown_user_is_rejected_before_admission() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let stranger = UserId::new();
        assert!(matches!(
            fx.orchestrator.create_job(stranger, request(5)).await,
            Err(OrchestratorError::UserNotFound(id)) if id == stranger
        ));
        assert_eq!(fx.compute.calls(), 0);
    }

    #[tokio::test]
    async fn insufficient_credits_is_side_effect_free() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 2).await;

        let err = fx.orchestrator.create_job(fx.user.id, request(15)).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InsufficientCredits { required: 3, available: 2 }
        ));

        let jobs = fx.orchestrator.list_jobs(fx.user.id, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(fx.credit_store.ledger_for_job(jobs[0].id).await.unwrap().is_empty());
        assert_eq!(fx.balance().await, 2);
        assert_eq!(fx.compute.calls(), 0);
    }

    #[tokio::test]
    async fn submission_failure_refunds_in_full() {
        let fx = Fixture::new(StubCompute::rejecting(), 5, 10).await;

        let err = fx.orchestrator.create_job(fx.user.id, request(10)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::SubmissionFailed(_)));

        let jobs = fx.orchestrator.list_jobs(fx.user.id, 1).await.unwrap();
        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.as_deref().unwrap().starts_with("Submission failed"));

        let kinds: Vec<_> = fx
            .credit_store
            .ledger_for_job(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.kind, e.amount))
            .collect();
        assert_eq!(
            kinds,
            vec![(LedgerEntryKind::Reservation, -2), (LedgerEntryKind::Refund, 2)]
        );
        assert_eq!(fx.balance().await, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_respect_the_cap() {
        let fx = Arc::new(Fixture::new(StubCompute::accepting(), 3, 100).await);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let fx = Arc::clone(&fx);
                tokio::spawn(async move { fx.orchestrator.create_job(fx.user.id, request(5)).await })
            })
            .collect();

        let mut admitted = 0;
        let mut limited = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(OrchestratorError::ConcurrencyLimitExceeded { limit: 3, .. }) => limited += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((admitted, limited), (3, 1));
        assert_eq!(fx.balance().await, 97);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_overdraw() {
        let fx = Arc::new(Fixture::new(StubCompute::accepting(), 10, 10).await);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let fx = Arc::clone(&fx);
                tokio::spawn(async move { fx.orchestrator.create_job(fx.user.id, request(15)).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(OrchestratorError::InsufficientCredits { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(fx.balance().await, 1);
        assert!(fx.credits.audit(fx.user.id).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn jobs_are_private_to_their_owner() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let admission = fx.orchestrator.create_job(fx.user.id, request(5)).await.unwrap();

        assert!(matches!(
            fx.orchestrator.get_job(UserId::new(), admission.job_id).await,
            Err(OrchestratorError::AccessDenied(_))
        ));
        assert!(matches!(
            fx.orchestrator.get_job(fx.user.id, JobId::new()).await,
            Err(OrchestratorError::JobNotFound(_))
        ));
    }
}
