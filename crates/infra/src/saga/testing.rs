//! Shared fixtures for saga tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use cineweave_auth::WebhookVerifier;
use cineweave_credits::User;
use cineweave_jobs::ExternalJobId;

use crate::credits::{CreditReservationService, CreditStore, InMemoryCreditStore};
use crate::external::{ComputeBackend, ComputeError, SubmitRequest};
use crate::jobs::InMemoryJobStore;

use super::{CallbackProcessor, JobOrchestrator};

pub struct StubCompute {
    accept: bool,
    calls: AtomicUsize,
}

impl StubCompute {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            accept: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            accept: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeBackend for StubCompute {
    async fn submit(&self, _request: &SubmitRequest) -> Result<ExternalJobId, ComputeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.accept {
            return Err(ComputeError::Api(500, "backend unavailable".to_string()));
        }
        ExternalJobId::new(format!("rp-{n}")).map_err(|e| ComputeError::Parse(e.to_string()))
    }
}

pub struct Fixture {
    pub credit_store: Arc<InMemoryCreditStore>,
    pub jobs: Arc<InMemoryJobStore>,
    pub credits: CreditReservationService,
    pub compute: Arc<StubCompute>,
    pub orchestrator: JobOrchestrator,
    pub callbacks: CallbackProcessor,
    pub verifier: WebhookVerifier,
    pub user: User,
}

impl Fixture {
    /// One user holding `welcome` credits, with a cap of `max_active` jobs.
    pub async fn new(compute: Arc<StubCompute>, max_active: usize, welcome: i64) -> Self {
        let credit_store = InMemoryCreditStore::arc();
        let jobs = InMemoryJobStore::arc();
        let credits = CreditReservationService::new(credit_store.clone(), welcome);
        let (user, _) = credits.ensure_user("user_test", None).await.unwrap();
        let verifier = WebhookVerifier::new("whsec_test").unwrap();

        Self {
            orchestrator: JobOrchestrator::new(
                jobs.clone(),
                credits.clone(),
                compute.clone(),
                max_active,
            ),
            callbacks: CallbackProcessor::new(verifier.clone(), jobs.clone(), credits.clone()),
            credit_store,
            jobs,
            credits,
            compute,
            verifier,
            user,
        }
    }

    pub async fn balance(&self) -> i64 {
        self.credit_store
            .find_user(self.user.id)
            .await
            .unwrap()
            .unwrap()
            .credits
    }
}
