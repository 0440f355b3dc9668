//! Postgres-backed credit store.
//!
//! ## Atomicity
//!
//! Every mutation runs in one transaction: a conditional `UPDATE users ...
//! RETURNING credits` (which takes the user's row lock) followed by the ledger
//! insert. Reservations use `WHERE credits >= $amount`, so the balance check
//! and the debit are a single statement and concurrent reservations serialize
//! on the row lock.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | CreditStoreError | Scenario |
//! |------------|----------------------|------------------|----------|
//! | Database (unique violation) | `23505` | `DuplicateSettlement` | Second reservation or refund for a job |
//! | Database (numeric out of range) | `22003` | `Rejected(BalanceOverflow)` | Balance exceeds BIGINT |
//! | Database (other) | Any other | `Storage` | Constraint or server errors |
//! | Other | N/A | `Storage` | Pool closed, network errors, etc. |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use cineweave_core::{JobId, LedgerEntryId, UserId};
use cineweave_credits::{CreditError, CreditMutation, LedgerEntry, LedgerEntryKind, PlanTier, User};

use super::store::{CreditStore, CreditStoreError};

#[derive(Debug, Clone)]
pub struct PostgresCreditStore {
    pool: Arc<PgPool>,
}

impl PostgresCreditStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    subject: String,
    email: Option<String>,
    plan: String,
    credits: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = CreditStoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: UserId::from_uuid(row.id),
            subject: row.subject,
            email: row.email,
            plan: row
                .plan
                .parse::<PlanTier>()
                .map_err(|e| CreditStoreError::Storage(e.to_string()))?,
            credits: row.credits,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct LedgerRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    balance_after: i64,
    kind: String,
    description: String,
    job_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = CreditStoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: LedgerEntryId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            amount: row.amount,
            balance_after: row.balance_after,
            kind: row
                .kind
                .parse::<LedgerEntryKind>()
                .map_err(|e| CreditStoreError::Storage(e.to_string()))?,
            description: row.description,
            job_id: row.job_id.map(JobId::from_uuid),
            created_at: row.created_at,
        })
    }
}

const USER_COLUMNS: &str = "id, subject, email, plan, credits, created_at";
const LEDGER_COLUMNS: &str =
    "id, user_id, amount, balance_after, kind, description, job_id, created_at";

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CreditStoreError {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("22003") => CreditStoreError::Rejected(CreditError::BalanceOverflow),
            _ => CreditStoreError::Storage(format!(
                "database error in {operation}: {}",
                db_err.message()
            )),
        },
        sqlx::Error::PoolClosed => {
            CreditStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => CreditStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn rows_into<R, T>(rows: Vec<R>) -> Result<Vec<T>, CreditStoreError>
where
    T: TryFrom<R, Error = CreditStoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    entry: &LedgerEntry,
) -> Result<(), CreditStoreError> {
    sqlx::query(
        r#"
        INSERT INTO credit_ledger (id, user_id, amount, balance_after, kind, description, job_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.user_id.as_uuid())
    .bind(entry.amount)
    .bind(entry.balance_after)
    .bind(entry.kind.as_str())
    .bind(&entry.description)
    .bind(entry.job_id.map(Uuid::from))
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| match (is_unique_violation(&e), entry.job_id) {
        (true, Some(job_id)) => CreditStoreError::DuplicateSettlement {
            job_id,
            kind: entry.kind,
        },
        _ => map_sqlx_error("insert_ledger_entry", e),
    })?;
    Ok(())
}

/// Refunds must match the job's reservation for the same user.
async fn check_refund(
    tx: &mut Transaction<'_, Postgres>,
    user_id: UserId,
    job_id: JobId,
    amount: i64,
) -> Result<(), CreditStoreError> {
    let reserved: Option<i64> = sqlx::query_scalar(
        "SELECT -amount FROM credit_ledger WHERE job_id = $1 AND user_id = $2 AND kind = 'reservation'",
    )
    .bind(job_id.as_uuid())
    .bind(user_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_refund", e))?;

    match reserved {
        None => Err(CreditStoreError::MissingReservation(job_id)),
        Some(reserved) if reserved != amount => Err(CreditStoreError::RefundMismatch {
            job_id,
            reserved,
            requested: amount,
        }),
        Some(_) => Ok(()),
    }
}

#[async_trait]
impl CreditStore for PostgresCreditStore {
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, CreditStoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(user_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_user", e))?;
        row.map(User::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_user_by_subject(&self, subject: &str) -> Result<Option<User>, CreditStoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE subject = $1"))
                .bind(subject)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_user_by_subject", e))?;
        row.map(User::try_from).transpose()
    }

    #[instrument(skip(self, email), err)]
    async fn get_or_create_user(
        &self,
        subject: &str,
        email: Option<&str>,
        welcome_credits: i64,
    ) -> Result<(User, bool), CreditStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let candidate = User::new(subject, email.map(str::to_owned), Utc::now());
        let inserted: Option<UserRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO users (id, subject, email, plan, credits, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (subject) DO NOTHING
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(candidate.id.as_uuid())
        .bind(&candidate.subject)
        .bind(&candidate.email)
        .bind(candidate.plan.as_str())
        .bind(welcome_credits.max(0))
        .bind(candidate.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_user", e))?;

        let (user, created) = match inserted {
            Some(row) => {
                let user = User::try_from(row)?;
                if welcome_credits > 0 {
                    let grant = CreditMutation::Grant {
                        amount: welcome_credits,
                        description: "Welcome bonus".to_string(),
                    };
                    insert_entry(&mut tx, &grant.to_entry(user.id, user.credits, Utc::now()))
                        .await?;
                }
                (user, true)
            }
            None => {
                let row: UserRow =
                    sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE subject = $1"))
                        .bind(subject)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("select_user", e))?;
                (User::try_from(row)?, false)
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok((user, created))
    }

    #[instrument(
        skip(self, mutation),
        fields(
            user_id = %user_id,
            kind = %mutation.kind(),
            amount = mutation.magnitude(),
            job_id = ?mutation.job_id()
        ),
        err
    )]
    async fn apply(
        &self,
        user_id: UserId,
        mutation: CreditMutation,
    ) -> Result<LedgerEntry, CreditStoreError> {
        let amount = mutation.magnitude();
        if amount <= 0 {
            return Err(CreditError::InvalidAmount(amount).into());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let CreditMutation::Refund { job_id, .. } = &mutation {
            check_refund(&mut tx, user_id, *job_id, amount).await?;
        }

        let update = match &mutation {
            CreditMutation::Reserve { .. } => {
                "UPDATE users SET credits = credits - $2 WHERE id = $1 AND credits >= $2 RETURNING credits"
            }
            CreditMutation::Grant { .. } | CreditMutation::Refund { .. } => {
                "UPDATE users SET credits = credits + $2 WHERE id = $1 RETURNING credits"
            }
        };
        let balance: Option<i64> = sqlx::query_scalar(update)
            .bind(user_id.as_uuid())
            .bind(amount)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_balance", e))?;

        let balance = match balance {
            Some(balance) => balance,
            None => {
                let available: Option<i64> =
                    sqlx::query_scalar("SELECT credits FROM users WHERE id = $1")
                        .bind(user_id.as_uuid())
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("select_balance", e))?;
                return Err(match available {
                    None => CreditStoreError::UserNotFound(user_id),
                    Some(available) => CreditError::InsufficientCredits {
                        required: amount,
                        available,
                    }
                    .into(),
                });
            }
        };

        let entry = mutation.to_entry(user_id, balance, Utc::now());
        insert_entry(&mut tx, &entry).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(entry)
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn recent_entries(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, CreditStoreError> {
        let rows: Vec<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM credit_ledger WHERE user_id = $1 ORDER BY seq DESC LIMIT $2"
        ))
        .bind(user_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_entries", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn ledger_for_user(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, CreditStoreError> {
        let rows: Vec<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM credit_ledger WHERE user_id = $1 ORDER BY seq ASC"
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_for_user", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn ledger_for_job(&self, job_id: JobId) -> Result<Vec<LedgerEntry>, CreditStoreError> {
        let rows: Vec<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM credit_ledger WHERE job_id = $1 ORDER BY seq ASC"
        ))
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_for_job", e))?;
        rows_into(rows)
    }
}
