//! Compute backend callbacks.
//!
//! Deliveries are at-least-once and unordered. The conditional status writes
//! in the job store are the idempotency guard: only the delivery that moves a
//! job out of `running` gets to settle it.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use cineweave_auth::WebhookVerifier;
use cineweave_jobs::{ArtifactRef, ExternalJobId, Job};

use crate::credits::{CreditReservationService, CreditStoreError, Settlement};
use crate::jobs::{JobStore, JobStoreError};

const MISSING_OUTPUT: &str = "missing output";
const UNKNOWN_ERROR: &str = "Unknown error";

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<CallbackOutput>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackOutput {
    #[serde(default, rename = "artifactRef", alias = "r2Url")]
    pub artifact_ref: Option<String>,
}

impl CallbackPayload {
    fn artifact(&self) -> Option<ArtifactRef> {
        self.output
            .as_ref()
            .and_then(|o| o.artifact_ref.as_deref())
            .and_then(|r| ArtifactRef::new(r.trim()).ok())
    }
}

/// What a delivery did; rendered as the acknowledgement body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    JobNotFound,
    AlreadySettled,
    Completed,
    Refunded,
    MissingOutput,
    Acknowledged,
}

impl CallbackOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::JobNotFound => "job not found",
            Self::AlreadySettled => "already settled",
            Self::Completed => "success",
            Self::Refunded => "refunded",
            Self::MissingOutput => "failed",
            Self::Acknowledged => "acknowledged",
        }
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::MissingOutput => Some(MISSING_OUTPUT),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("invalid callback signature")]
    InvalidSignature,

    #[error("malformed callback payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Credits(#[from] CreditStoreError),
}

pub struct CallbackProcessor {
    verifier: WebhookVerifier,
    jobs: Arc<dyn JobStore>,
    credits: CreditReservationService,
}

impl CallbackProcessor {
    pub fn new(
        verifier: WebhookVerifier,
        jobs: Arc<dyn JobStore>,
        credits: CreditReservationService,
    ) -> Self {
        Self {
            verifier,
            jobs,
            credits,
        }
    }

    /// Verify and apply one delivery. Nothing is read or written before the
    /// signature checks out.
    #[instrument(skip_all, err)]
    pub async fn process(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<CallbackOutcome, CallbackError> {
        let signature = signature.ok_or(CallbackError::InvalidSignature)?;
        self.verifier.verify(raw_body, signature).map_err(|e| {
            warn!(error = %e, "rejected callback signature");
            CallbackError::InvalidSignature
        })?;

        let payload: CallbackPayload = serde_json::from_slice(raw_body)
            .map_err(|e| CallbackError::MalformedPayload(e.to_string()))?;
        self.apply(payload).await
    }

    #[instrument(skip_all, fields(external_job_id = %payload.id, status = %payload.status), err)]
    async fn apply(&self, payload: CallbackPayload) -> Result<CallbackOutcome, CallbackError> {
        let external_id = ExternalJobId::new(payload.id.as_str())
            .map_err(|e| CallbackError::MalformedPayload(e.to_string()))?;

        let Some(job) = self.jobs.find_by_external_id(&external_id).await? else {
            info!("callback for unknown job");
            return Ok(CallbackOutcome::JobNotFound);
        };

        if job.status.is_terminal() {
            // A crash between failing and refunding is repaired here.
            self.credits.settle_failed_job(&job).await?;
            debug!(job_id = %job.id, "duplicate callback for settled job");
            return Ok(CallbackOutcome::AlreadySettled);
        }

        match payload.status.as_str() {
            "COMPLETED" => match payload.artifact() {
                Some(artifact) => match self.jobs.mark_done(job.id, artifact).await? {
                    Some(done) => {
                        info!(job_id = %done.id, "job completed");
                        Ok(CallbackOutcome::Completed)
                    }
                    None => Ok(CallbackOutcome::AlreadySettled),
                },
                None => {
                    warn!(job_id = %job.id, "completed callback without output");
                    self.fail(&job, MISSING_OUTPUT, CallbackOutcome::MissingOutput)
                        .await
                }
            },
            "FAILED" => {
                let reason = payload
                    .error
                    .as_deref()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or(UNKNOWN_ERROR);
                self.fail(&job, reason, CallbackOutcome::Refunded).await
            }
            _ => Ok(CallbackOutcome::Acknowledged),
        }
    }

    /// Transition to `failed`, then post the refund. A delivery that loses the
    /// race for the transition leaves settlement to the winner.
    async fn fail(
        &self,
        job: &Job,
        reason: &str,
        outcome: CallbackOutcome,
    ) -> Result<CallbackOutcome, CallbackError> {
        let Some(failed) = self.jobs.mark_failed(job.id, reason).await? else {
            return Ok(CallbackOutcome::AlreadySettled);
        };

        match self.credits.settle_failed_job(&failed).await? {
            Settlement::Refunded(entry) => {
                info!(job_id = %failed.id, amount = entry.amount, reason, "job failed; credits refunded");
            }
            other => {
                warn!(job_id = %failed.id, settlement = ?other, "job failed without a refund");
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::CreditStore;
    use crate::saga::testing::{Fixture, StubCompute};
    use chrono::Utc;
    use cineweave_credits::LedgerEntryKind;
    use cineweave_jobs::{JobRequest, JobStatus};
    use serde_json::json;

    async fn running_job(fx: &Fixture) -> Job {
        let req = JobRequest::new("city lights", 15, None, None, None).unwrap();
        let admission = fx.orchestrator.create_job(fx.user.id, req).await.unwrap();
        fx.orchestrator.get_job(fx.user.id, admission.job_id).await.unwrap()
    }

    fn external(job: &Job) -> String {
        job.external_job_id.as_ref().unwrap().to_string()
    }

    async fn deliver(fx: &Fixture, body: serde_json::Value) -> Result<CallbackOutcome, CallbackError> {
        let raw = serde_json::to_vec(&body).unwrap();
        let signature = fx.verifier.sign(&raw);
        fx.callbacks.process(&raw, Some(&signature)).await
    }

    async fn refunds(fx: &Fixture, job: &Job) -> usize {
        fx.credit_store
            .ledger_for_job(job.id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.kind == LedgerEntryKind::Refund)
            .count()
    }

    #[tokio::test]
    async fn completed_with_artifact_marks_done_without_ledger_change() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let job = running_job(&fx).await;
        let before = Utc::now();

        let outcome = deliver(
            &fx,
            json!({"id": external(&job), "status": "COMPLETED", "output": {"artifactRef": "https://cdn.example/outputs/v.mp4"}}),
        )
        .await
        .unwrap();
        assert_eq!(outcome, CallbackOutcome::Completed);

        let done = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(
            done.artifact_ref.unwrap().as_str(),
            "https://cdn.example/outputs/v.mp4"
        );
        let expires_at = done.expires_at.unwrap();
        assert!(expires_at >= before + chrono::Duration::hours(24));
        assert!(expires_at <= Utc::now() + chrono::Duration::hours(24));

        assert_eq!(fx.credit_store.ledger_for_job(job.id).await.unwrap().len(), 1);
        assert_eq!(fx.balance().await, 7);
    }

    #[tokio::test]
    async fn legacy_output_field_is_accepted() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let job = running_job(&fx).await;

        let outcome = deliver(
            &fx,
            json!({"id": external(&job), "status": "COMPLETED", "output": {"r2Url": "outputs/v.mp4"}}),
        )
        .await
        .unwrap();
        assert_eq!(outcome, CallbackOutcome::Completed);
    }

    #[tokio::test]
    async fn completed_without_output_fails_and_refunds_once() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let job = running_job(&fx).await;
        let body = json!({"id": external(&job), "status": "COMPLETED", "output": {}});

        let outcome = deliver(&fx, body.clone()).await.unwrap();
        assert_eq!(outcome, CallbackOutcome::MissingOutput);
        assert_eq!(outcome.reason(), Some("missing output"));

        let failed = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("missing output"));
        assert_eq!(refunds(&fx, &job).await, 1);
        assert_eq!(fx.balance().await, 10);

        assert_eq!(deliver(&fx, body).await.unwrap(), CallbackOutcome::AlreadySettled);
        assert_eq!(refunds(&fx, &job).await, 1);
    }

    #[tokio::test]
    async fn duplicate_failure_refunds_exactly_once() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let job = running_job(&fx).await;
        let body = json!({"id": external(&job), "status": "FAILED", "error": "CUDA out of memory"});

        assert_eq!(deliver(&fx, body.clone()).await.unwrap(), CallbackOutcome::Refunded);
        assert_eq!(deliver(&fx, body).await.unwrap(), CallbackOutcome::AlreadySettled);

        assert_eq!(refunds(&fx, &job).await, 1);
        assert_eq!(fx.balance().await, 10);
        let failed = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("CUDA out of memory"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_refund_exactly_once() {
        let fx = Arc::new(Fixture::new(StubCompute::accepting(), 5, 10).await);
        let job = running_job(&fx).await;
        let body = json!({"id": external(&job), "status": "FAILED"});

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fx = Arc::clone(&fx);
                let body = body.clone();
                tokio::spawn(async move { deliver(&fx, body).await })
            })
            .collect();

        let mut refunded = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == CallbackOutcome::Refunded {
                refunded += 1;
            }
        }
        assert_eq!(refunded, 1);
        assert_eq!(refunds(&fx, &job).await, 1);
        assert_eq!(fx.balance().await, 10);
    }

    #[tokio::test]
    async fn failure_without_error_uses_default_reason() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let job = running_job(&fx).await;

        deliver(&fx, json!({"id": external(&job), "status": "FAILED"}))
            .await
            .unwrap();
        let failed = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("Unknown error"));
    }

    #[tokio::test]
    async fn late_failure_after_completion_is_ignored() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let job = running_job(&fx).await;

        deliver(&fx, json!({"id": external(&job), "status": "COMPLETED", "output": {"artifactRef": "k"}}))
            .await
            .unwrap();
        let outcome = deliver(&fx, json!({"id": external(&job), "status": "FAILED", "error": "late"}))
            .await
            .unwrap();

        assert_eq!(outcome, CallbackOutcome::AlreadySettled);
        assert_eq!(fx.jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Done);
        assert_eq!(refunds(&fx, &job).await, 0);
    }

    #[tokio::test]
    async fn progress_updates_and_unknown_jobs_are_acknowledged() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let job = running_job(&fx).await;

        assert_eq!(
            deliver(&fx, json!({"id": external(&job), "status": "IN_PROGRESS"})).await.unwrap(),
            CallbackOutcome::Acknowledged
        );
        assert_eq!(fx.jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Running);

        assert_eq!(
            deliver(&fx, json!({"id": "rp-unknown", "status": "FAILED"})).await.unwrap(),
            CallbackOutcome::JobNotFound
        );
    }

    #[tokio::test]
    async fn bad_or_missing_signature_changes_nothing() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let job = running_job(&fx).await;
        let raw = serde_json::to_vec(&json!({"id": external(&job), "status": "FAILED"})).unwrap();

        assert!(matches!(
            fx.callbacks.process(&raw, Some("deadbeef")).await,
            Err(CallbackError::InvalidSignature)
        ));
        assert!(matches!(
            fx.callbacks.process(&raw, None).await,
            Err(CallbackError::InvalidSignature)
        ));
        assert_eq!(fx.jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(fx.balance().await, 7);
    }

    #[tokio::test]
    async fn signed_garbage_is_malformed() {
        let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
        let raw = b"not json";
        let signature = format!("sha256={}", fx.verifier.sign(raw));
        assert!(matches!(
            fx.callbacks.process(raw, Some(&signature)).await,
            Err(CallbackError::MalformedPayload(_))
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn delivery() -> impl Strategy<Value = serde_json::Value> {
            prop_oneof![
                Just(json!({"status": "COMPLETED", "output": {"artifactRef": "outputs/a.mp4"}})),
                Just(json!({"status": "COMPLETED"})),
                Just(json!({"status": "FAILED", "error": "boom"})),
                Just(json!({"status": "IN_PROGRESS"})),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

            #[test]
            fn any_delivery_sequence_settles_at_most_once(
                sequence in prop::collection::vec(delivery(), 1..8)
            ) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let fx = Fixture::new(StubCompute::accepting(), 5, 10).await;
                    let job = running_job(&fx).await;

                    for mut body in sequence {
                        body["id"] = json!(external(&job));
                        deliver(&fx, body).await.unwrap();
                    }

                    let job = fx.jobs.get(job.id).await.unwrap().unwrap();
                    let refunded = refunds(&fx, &job).await;
                    assert!(refunded <= 1);
                    match job.status {
                        JobStatus::Failed => assert_eq!((refunded, fx.balance().await), (1, 10)),
                        _ => assert_eq!((refunded, fx.balance().await), (0, 7)),
                    }
                    assert!(fx.credits.audit(fx.user.id).await.unwrap().is_consistent());
                });
            }
        }
    }
}
