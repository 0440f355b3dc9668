//! Postgres connection pool and schema.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::DatabaseConfig;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        subject TEXT NOT NULL UNIQUE,
        email TEXT,
        plan TEXT NOT NULL CHECK (plan IN ('starter', 'creator', 'studio')),
        credits BIGINT NOT NULL CHECK (credits >= 0),
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        prompt TEXT NOT NULL,
        image_url TEXT,
        duration_sec INTEGER NOT NULL,
        seed BIGINT,
        cfg DOUBLE PRECISION NOT NULL,
        credits_used BIGINT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'done', 'failed')),
        external_job_id TEXT UNIQUE,
        artifact_ref TEXT,
        error_message TEXT,
        expires_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_user_created_idx ON jobs (user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status)",
    "CREATE INDEX IF NOT EXISTS jobs_failed_id_idx ON jobs (id) WHERE status = 'failed'",
    r#"
    CREATE TABLE IF NOT EXISTS credit_ledger (
        seq BIGSERIAL PRIMARY KEY,
        id UUID NOT NULL UNIQUE,
        user_id UUID NOT NULL REFERENCES users(id),
        amount BIGINT NOT NULL,
        balance_after BIGINT NOT NULL CHECK (balance_after >= 0),
        kind TEXT NOT NULL CHECK (kind IN ('grant', 'reservation', 'refund')),
        description TEXT NOT NULL,
        job_id UUID,
        created_at TIMESTAMPTZ NOT NULL,
        CHECK (kind = 'grant' OR job_id IS NOT NULL)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS credit_ledger_user_idx ON credit_ledger (user_id, seq)",
    "CREATE UNIQUE INDEX IF NOT EXISTS credit_ledger_one_reservation_per_job ON credit_ledger (job_id) WHERE kind = 'reservation'",
    "CREATE UNIQUE INDEX IF NOT EXISTS credit_ledger_one_refund_per_job ON credit_ledger (job_id) WHERE kind = 'refund'",
];

/// Open a connection pool.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(config.url.expose())
        .await
}

/// Create tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("database schema ready");
    Ok(())
}
