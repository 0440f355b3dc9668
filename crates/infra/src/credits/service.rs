//! Credit Reservation Service: the only writer of balances.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use cineweave_core::{JobId, UserId};
use cineweave_credits::{
    CreditMutation, LedgerAudit, LedgerEntry, LedgerEntryKind, User, audit_ledger,
};
use cineweave_jobs::{Job, JobStatus};

use super::store::{CreditStore, CreditStoreError};

/// Outcome of settling a failed job's billing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// A compensating refund was written by this call.
    Refunded(LedgerEntry),
    /// The job never reserved credits.
    NothingReserved,
    /// A refund already exists for the job.
    AlreadyRefunded,
    /// Only failed jobs are refunded.
    NotFailed,
}

#[derive(Clone)]
pub struct CreditReservationService {
    store: Arc<dyn CreditStore>,
    welcome_credits: i64,
}

impl CreditReservationService {
    pub fn new(store: Arc<dyn CreditStore>, welcome_credits: i64) -> Self {
        Self {
            store,
            welcome_credits,
        }
    }

    /// Debit `amount` for `job_id`; fails without side effects if the balance is short.
    #[instrument(skip_all, fields(user_id = %user_id, job_id = %job_id, amount = amount), err)]
    pub async fn reserve(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        description: impl Into<String> + Send,
    ) -> Result<LedgerEntry, CreditStoreError> {
        let mutation = CreditMutation::Reserve {
            amount,
            job_id,
            description: description.into(),
        };
        self.store.apply(user_id, mutation).await
    }

    /// Credit back a job's reservation. At most one refund exists per job.
    #[instrument(skip_all, fields(user_id = %user_id, job_id = %job_id, amount = amount), err)]
    pub async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        reason: impl Into<String> + Send,
    ) -> Result<LedgerEntry, CreditStoreError> {
        let mutation = CreditMutation::Refund {
            amount,
            job_id,
            reason: reason.into(),
        };
        let entry = self.store.apply(user_id, mutation).await?;
        info!(balance_after = entry.balance_after, "credits refunded");
        Ok(entry)
    }

    /// Get-or-create the user behind an identity subject.
    pub async fn ensure_user(
        &self,
        subject: &str,
        email: Option<&str>,
    ) -> Result<(User, bool), CreditStoreError> {
        let (user, created) = self
            .store
            .get_or_create_user(subject, email, self.welcome_credits)
            .await?;
        if created {
            info!(user_id = %user.id, credits = user.credits, "user created");
        }
        Ok((user, created))
    }

    pub async fn user(&self, user_id: UserId) -> Result<User, CreditStoreError> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or(CreditStoreError::UserNotFound(user_id))
    }

    pub async fn user_by_subject(&self, subject: &str) -> Result<Option<User>, CreditStoreError> {
        self.store.find_user_by_subject(subject).await
    }

    /// Ledger entries, newest first.
    pub async fn history(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, CreditStoreError> {
        self.store.recent_entries(user_id, limit).await
    }

    /// Recompute the user's ledger and compare it with the stored balance.
    pub async fn audit(&self, user_id: UserId) -> Result<LedgerAudit, CreditStoreError> {
        let user = self.user(user_id).await?;
        let entries = self.store.ledger_for_user(user_id).await?;
        let audit = audit_ledger(&entries, user.credits);
        if !audit.is_consistent() {
            warn!(user_id = %user_id, ?audit, "ledger does not match stored balance");
        }
        Ok(audit)
    }

    /// Post the compensating refund for a failed job, if one is owed.
    ///
    /// Safe to call repeatedly: a job with no reservation or an existing refund
    /// is left alone.
    #[instrument(skip_all, fields(job_id = %job.id, user_id = %job.user_id), err)]
    pub async fn settle_failed_job(&self, job: &Job) -> Result<Settlement, CreditStoreError> {
        if job.status != JobStatus::Failed {
            return Ok(Settlement::NotFailed);
        }

        let entries = self.store.ledger_for_job(job.id).await?;
        let Some(reservation) = entries
            .iter()
            .find(|e| e.kind == LedgerEntryKind::Reservation)
        else {
            return Ok(Settlement::NothingReserved);
        };
        if entries.iter().any(|e| e.kind == LedgerEntryKind::Refund) {
            return Ok(Settlement::AlreadyRefunded);
        }

        let reason = job.error_message.as_deref().unwrap_or("job failed");
        match self
            .refund(job.user_id, -reservation.amount, job.id, reason)
            .await
        {
            Ok(entry) => Ok(Settlement::Refunded(entry)),
            Err(CreditStoreError::DuplicateSettlement { .. }) => Ok(Settlement::AlreadyRefunded),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::InMemoryCreditStore;
    use chrono::Utc;
    use cineweave_jobs::JobRequest;

    async fn setup(welcome: i64) -> (CreditReservationService, User) {
        let service = CreditReservationService::new(InMemoryCreditStore::arc(), welcome);
        let (user, _) = service.ensure_user("user_1", None).await.unwrap();
        (service, user)
    }

    fn failed_job(user: &User) -> Job {
        let req = JobRequest::new("storm over the sea", 15, None, None, None).unwrap();
        let mut job = Job::new(user.id, &req, Utc::now());
        job.mark_failed("GPU out of memory", Utc::now()).unwrap();
        job
    }

    #[tokio::test]
    async fn settle_refunds_exactly_once() {
        let (service, user) = setup(10).await;
        let job = failed_job(&user);
        service
            .reserve(user.id, job.credits_used, job.id, "Video generation (15s)")
            .await
            .unwrap();

        match service.settle_failed_job(&job).await.unwrap() {
            Settlement::Refunded(entry) => {
                assert_eq!(entry.amount, 3);
                assert_eq!(entry.description, "Refund: GPU out of memory");
            }
            other => panic!("expected refund, got {other:?}"),
        }
        assert_eq!(
            service.settle_failed_job(&job).await.unwrap(),
            Settlement::AlreadyRefunded
        );
        assert_eq!(service.user(user.id).await.unwrap().credits, 10);
    }

    #[tokio::test]
    async fn settle_skips_jobs_without_reservation_or_not_failed() {
        let (service, user) = setup(10).await;
        let job = failed_job(&user);
        assert_eq!(
            service.settle_failed_job(&job).await.unwrap(),
            Settlement::NothingReserved
        );

        let req = JobRequest::new("p", 5, None, None, None).unwrap();
        let queued = Job::new(user.id, &req, Utc::now());
        assert_eq!(
            service.settle_failed_job(&queued).await.unwrap(),
            Settlement::NotFailed
        );
    }

    #[tokio::test]
    async fn audit_matches_after_mixed_activity() {
        let (service, user) = setup(80).await;
        for _ in 0..3 {
            let job = failed_job(&user);
            service.reserve(user.id, 3, job.id, "Video generation (15s)").await.unwrap();
            service.settle_failed_job(&job).await.unwrap();
        }
        service.reserve(user.id, 2, JobId::new(), "Video generation (10s)").await.unwrap();

        let audit = service.audit(user.id).await.unwrap();
        assert!(audit.is_consistent());
        assert_eq!(audit.stored_balance, 78);
        assert_eq!(audit.entries, 8);
    }

    #[tokio::test]
    async fn unknown_user_is_reported() {
        let (service, _) = setup(0).await;
        let missing = UserId::new();
        assert!(matches!(
            service.reserve(missing, 1, JobId::new(), "x").await,
            Err(CreditStoreError::UserNotFound(id)) if id == missing
        ));
    }
}
