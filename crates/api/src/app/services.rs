//! Application context: every service a handler needs, built once at startup.
//!
//! Stores are in-memory unless `USE_PERSISTENT_STORES` selects Postgres. The
//! pool (when any) is closed by `shutdown`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use cineweave_auth::{Hs256Verifier, JwksCache, JwksVerifier, TokenVerifier, WebhookVerifier};
use cineweave_infra::config::{AppConfig, IdentityConfig, StorageConfig};
use cineweave_infra::credits::{
    CreditReservationService, CreditStore, InMemoryCreditStore, PostgresCreditStore,
};
use cineweave_infra::db;
use cineweave_infra::external::{
    ArtifactLinkIssuer, HttpComputeBackend, PublicLinkIssuer, S3Presigner,
};
use cineweave_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use cineweave_infra::saga::{CallbackProcessor, JobOrchestrator, Reconciler};
use cineweave_jobs::{Job, JobStatus};

/// Failed jobs read per page by the startup sweep.
const RECONCILE_PAGE_SIZE: usize = 500;

pub struct AppServices {
    pub environment: String,
    pub allowed_origins: Vec<String>,
    pub credits: CreditReservationService,
    pub orchestrator: JobOrchestrator,
    pub callbacks: CallbackProcessor,
    pub reconciler: Reconciler,
    pub token_verifier: Arc<dyn TokenVerifier>,
    pub link_issuer: Arc<dyn ArtifactLinkIssuer>,
    pub download_link_ttl: Duration,
    pool: Option<PgPool>,
}

impl AppServices {
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let pool = match &config.database {
            Some(database) => {
                let pool = db::connect(database)
                    .await
                    .context("failed to connect to Postgres")?;
                db::ensure_schema(&pool)
                    .await
                    .context("failed to apply schema")?;
                info!("using Postgres stores");
                Some(pool)
            }
            None => {
                warn!("using in-memory stores; data is lost on restart");
                None
            }
        };

        let (credit_store, job_store): (Arc<dyn CreditStore>, Arc<dyn JobStore>) = match &pool {
            Some(pool) => (
                Arc::new(PostgresCreditStore::new(pool.clone())),
                Arc::new(PostgresJobStore::new(pool.clone())),
            ),
            None => (
                Arc::new(InMemoryCreditStore::new()),
                Arc::new(InMemoryJobStore::new()),
            ),
        };

        let token_verifier: Arc<dyn TokenVerifier> = match &config.identity {
            IdentityConfig::Jwks {
                url,
                issuer,
                cache_ttl,
            } => Arc::new(JwksVerifier::new(JwksCache::new(url.as_str(), *cache_ttl), issuer)),
            IdentityConfig::SharedSecret { secret } => {
                Arc::new(Hs256Verifier::new(secret.expose()))
            }
        };

        let link_issuer: Arc<dyn ArtifactLinkIssuer> = match &config.storage {
            StorageConfig::Presigned(s3) => {
                Arc::new(S3Presigner::new(s3).context("invalid storage configuration")?)
            }
            StorageConfig::Public { base_url } => Arc::new(PublicLinkIssuer::new(base_url.as_str())),
        };

        let compute = Arc::new(
            HttpComputeBackend::new(&config.compute).context("failed to build compute client")?,
        );
        let webhook = WebhookVerifier::new(config.webhook_secret.expose())
            .context("invalid webhook secret")?;

        let credits = CreditReservationService::new(credit_store, config.welcome_credits);

        let mut allowed_origins = vec![config.app_base_url.clone()];
        if config.app_base_url != "http://localhost:3000" {
            allowed_origins.push("http://localhost:3000".to_string());
        }

        Ok(Self {
            environment: config.environment.clone(),
            allowed_origins,
            orchestrator: JobOrchestrator::new(
                job_store.clone(),
                credits.clone(),
                compute,
                config.max_concurrent_jobs_per_user,
            ),
            callbacks: CallbackProcessor::new(webhook, job_store.clone(), credits.clone()),
            reconciler: Reconciler::new(job_store, credits.clone()),
            credits,
            token_verifier,
            link_issuer,
            download_link_ttl: config.download_link_ttl,
            pool,
        })
    }

    /// Startup hook: settle any compensation a previous process left unfinished.
    pub async fn startup(&self) {
        if let Err(e) = self.reconciler.run_once(RECONCILE_PAGE_SIZE).await {
            warn!(error = %e, "startup reconciliation failed");
        }
    }

    /// Shutdown hook: release the database pool.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
            info!("database pool closed");
        }
    }

    /// Download link for a finished job, if it has an artifact.
    pub fn download_url(&self, job: &Job) -> Option<String> {
        if job.status != JobStatus::Done {
            return None;
        }
        let artifact = job.artifact_ref.as_ref()?;
        match self
            .link_issuer
            .issue_download_link(&artifact.object_key(), self.download_link_ttl)
        {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to issue download link");
                None
            }
        }
    }
}
