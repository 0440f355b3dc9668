//! Credit store abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use cineweave_core::{JobId, UserId};
use cineweave_credits::{CreditError, CreditMutation, LedgerEntry, LedgerEntryKind, User};

/// Persistence for balances and the ledger.
///
/// `apply` is the only way to change a balance. Implementations must check,
/// mutate and append the ledger entry as one atomic unit per user, so that
/// concurrent reservations can never overdraw the balance.
#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, CreditStoreError>;

    async fn find_user_by_subject(&self, subject: &str) -> Result<Option<User>, CreditStoreError>;

    /// Fetch the user for `subject`, creating it with a welcome grant if absent.
    ///
    /// Returns the user and whether it was created by this call.
    async fn get_or_create_user(
        &self,
        subject: &str,
        email: Option<&str>,
        welcome_credits: i64,
    ) -> Result<(User, bool), CreditStoreError>;

    /// Apply a mutation and append its ledger entry atomically.
    async fn apply(
        &self,
        user_id: UserId,
        mutation: CreditMutation,
    ) -> Result<LedgerEntry, CreditStoreError>;

    /// Most recent entries first.
    async fn recent_entries(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, CreditStoreError>;

    /// Every entry for the user, oldest first.
    async fn ledger_for_user(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, CreditStoreError>;

    async fn ledger_for_job(&self, job_id: JobId) -> Result<Vec<LedgerEntry>, CreditStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CreditStoreError {
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    #[error(transparent)]
    Rejected(#[from] CreditError),

    #[error("no reservation recorded for job {0}")]
    MissingReservation(JobId),

    #[error("refund of {requested} does not match reservation of {reserved} for job {job_id}")]
    RefundMismatch {
        job_id: JobId,
        reserved: i64,
        requested: i64,
    },

    #[error("job {job_id} already has a {kind} entry")]
    DuplicateSettlement { job_id: JobId, kind: LedgerEntryKind },

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, User>,
    by_subject: HashMap<String, UserId>,
    /// Append-only, in commit order.
    ledger: Vec<LedgerEntry>,
}

impl State {
    fn job_entry(&self, job_id: JobId, kind: LedgerEntryKind) -> Option<&LedgerEntry> {
        self.ledger
            .iter()
            .find(|e| e.job_id == Some(job_id) && e.kind == kind)
    }

    fn apply(
        &mut self,
        user_id: UserId,
        mutation: &CreditMutation,
    ) -> Result<LedgerEntry, CreditStoreError> {
        let balance = self
            .users
            .get(&user_id)
            .map(|u| u.credits)
            .ok_or(CreditStoreError::UserNotFound(user_id))?;

        match mutation {
            CreditMutation::Grant { .. } => {}
            CreditMutation::Reserve { job_id, .. } => {
                if self.job_entry(*job_id, LedgerEntryKind::Reservation).is_some() {
                    return Err(CreditStoreError::DuplicateSettlement {
                        job_id: *job_id,
                        kind: LedgerEntryKind::Reservation,
                    });
                }
            }
            CreditMutation::Refund { amount, job_id, .. } => {
                let reservation = self
                    .job_entry(*job_id, LedgerEntryKind::Reservation)
                    .filter(|e| e.user_id == user_id)
                    .ok_or(CreditStoreError::MissingReservation(*job_id))?;
                if -reservation.amount != *amount {
                    return Err(CreditStoreError::RefundMismatch {
                        job_id: *job_id,
                        reserved: -reservation.amount,
                        requested: *amount,
                    });
                }
                if self.job_entry(*job_id, LedgerEntryKind::Refund).is_some() {
                    return Err(CreditStoreError::DuplicateSettlement {
                        job_id: *job_id,
                        kind: LedgerEntryKind::Refund,
                    });
                }
            }
        }

        let next = mutation.apply_to(balance)?;
        let entry = mutation.to_entry(user_id, next, Utc::now());
        if let Some(user) = self.users.get_mut(&user_id) {
            user.credits = next;
        }
        self.ledger.push(entry.clone());
        Ok(entry)
    }
}

/// In-memory credit store for tests/dev.
///
/// One lock guards users and ledger together, which makes every `apply`
/// trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryCreditStore {
    state: Mutex<State>,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, CreditStoreError> {
        self.state
            .lock()
            .map_err(|_| CreditStoreError::Storage("credit store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, CreditStoreError> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_subject(&self, subject: &str) -> Result<Option<User>, CreditStoreError> {
        let state = self.lock()?;
        Ok(state
            .by_subject
            .get(subject)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn get_or_create_user(
        &self,
        subject: &str,
        email: Option<&str>,
        welcome_credits: i64,
    ) -> Result<(User, bool), CreditStoreError> {
        let mut state = self.lock()?;
        if let Some(user) = state.by_subject.get(subject).and_then(|id| state.users.get(id)) {
            return Ok((user.clone(), false));
        }

        let user = User::new(subject, email.map(str::to_owned), Utc::now());
        let user_id = user.id;
        state.by_subject.insert(subject.to_string(), user_id);
        state.users.insert(user_id, user);

        if welcome_credits > 0 {
            state.apply(
                user_id,
                &CreditMutation::Grant {
                    amount: welcome_credits,
                    description: "Welcome bonus".to_string(),
                },
            )?;
        }

        let user = state
            .users
            .get(&user_id)
            .cloned()
            .ok_or(CreditStoreError::UserNotFound(user_id))?;
        Ok((user, true))
    }

    async fn apply(
        &self,
        user_id: UserId,
        mutation: CreditMutation,
    ) -> Result<LedgerEntry, CreditStoreError> {
        self.lock()?.apply(user_id, &mutation)
    }

    async fn recent_entries(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, CreditStoreError> {
        let state = self.lock()?;
        Ok(state
            .ledger
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ledger_for_user(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, CreditStoreError> {
        let state = self.lock()?;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn ledger_for_job(&self, job_id: JobId) -> Result<Vec<LedgerEntry>, CreditStoreError> {
        let state = self.lock()?;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.job_id == Some(job_id))
            .cloned()
            .collect())
    }
}
