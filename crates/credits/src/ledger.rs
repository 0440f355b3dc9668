//! Credit ledger: balance-affecting mutations and the entries they produce.
//!
//! A store applies a [`CreditMutation`] to the user's current balance and, in
//! the same atomic unit, appends the [`LedgerEntry`] built from the result.
//! For every user the ledger ordered by creation is a running sum whose last
//! `balance_after` equals the stored balance.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cineweave_core::{DomainError, JobId, LedgerEntryId, UserId};

/// Kind of balance-affecting event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    /// Credits granted to the user (welcome bonus, plan allowance).
    Grant,
    /// Credits debited when a job is admitted.
    Reservation,
    /// Compensating credit for a failed job's reservation.
    Refund,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Grant => "grant",
            LedgerEntryKind::Reservation => "reservation",
            LedgerEntryKind::Refund => "refund",
        }
    }
}

impl fmt::Display for LedgerEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEntryKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(LedgerEntryKind::Grant),
            "reservation" => Ok(LedgerEntryKind::Reservation),
            "refund" => Ok(LedgerEntryKind::Refund),
            other => Err(DomainError::validation(format!(
                "unknown ledger entry kind: {other}"
            ))),
        }
    }
}

/// Immutable ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    /// Signed change applied to the balance.
    pub amount: i64,
    /// The user's balance immediately after this entry.
    pub balance_after: i64,
    pub kind: LedgerEntryKind,
    pub description: String,
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
}

/// Failure to apply a mutation to a balance.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CreditError {
    #[error("credit amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("credit balance overflow")]
    BalanceOverflow,
}

/// A requested change to a user's balance.
///
/// Amounts are always given as positive magnitudes; the variant decides the
/// sign of the resulting ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditMutation {
    Grant {
        amount: i64,
        description: String,
    },
    Reserve {
        amount: i64,
        job_id: JobId,
        description: String,
    },
    Refund {
        amount: i64,
        job_id: JobId,
        reason: String,
    },
}

impl CreditMutation {
    pub fn kind(&self) -> LedgerEntryKind {
        match self {
            CreditMutation::Grant { .. } => LedgerEntryKind::Grant,
            CreditMutation::Reserve { .. } => LedgerEntryKind::Reservation,
            CreditMutation::Refund { .. } => LedgerEntryKind::Refund,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            CreditMutation::Grant { .. } => None,
            CreditMutation::Reserve { job_id, .. } | CreditMutation::Refund { job_id, .. } => {
                Some(*job_id)
            }
        }
    }

    /// Unsigned magnitude of the mutation.
    pub fn magnitude(&self) -> i64 {
        match self {
            CreditMutation::Grant { amount, .. }
            | CreditMutation::Reserve { amount, .. }
            | CreditMutation::Refund { amount, .. } => *amount,
        }
    }

    /// Signed amount as recorded in the ledger.
    pub fn signed_amount(&self) -> i64 {
        match self {
            CreditMutation::Reserve { amount, .. } => -amount,
            CreditMutation::Grant { amount, .. } | CreditMutation::Refund { amount, .. } => *amount,
        }
    }

    pub fn description(&self) -> String {
        match self {
            CreditMutation::Grant { description, .. }
            | CreditMutation::Reserve { description, .. } => description.clone(),
            CreditMutation::Refund { reason, .. } => format!("Refund: {reason}"),
        }
    }

    /// Compute the balance after applying this mutation to `balance`.
    ///
    /// Reservations never drive the balance below zero.
    pub fn apply_to(&self, balance: i64) -> Result<i64, CreditError> {
        let amount = self.magnitude();
        if amount <= 0 {
            return Err(CreditError::InvalidAmount(amount));
        }
        match self {
            CreditMutation::Reserve { .. } => {
                if balance < amount {
                    return Err(CreditError::InsufficientCredits {
                        required: amount,
                        available: balance,
                    });
                }
                Ok(balance - amount)
            }
            CreditMutation::Grant { .. } | CreditMutation::Refund { .. } => balance
                .checked_add(amount)
                .ok_or(CreditError::BalanceOverflow),
        }
    }

    /// Build the ledger entry recording this mutation.
    pub fn to_entry(&self, user_id: UserId, balance_after: i64, now: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id: LedgerEntryId::new(),
            user_id,
            amount: self.signed_amount(),
            balance_after,
            kind: self.kind(),
            description: self.description(),
            job_id: self.job_id(),
            created_at: now,
        }
    }
}

/// Result of recomputing a user's ledger against the stored balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerAudit {
    pub entries: usize,
    pub ledger_sum: i64,
    pub stored_balance: i64,
    pub latest_balance_after: Option<i64>,
    /// First entry whose `balance_after` disagrees with the running sum.
    pub first_mismatch: Option<LedgerEntryId>,
}

impl LedgerAudit {
    pub fn is_consistent(&self) -> bool {
        self.first_mismatch.is_none()
            && self.ledger_sum == self.stored_balance
            && self.latest_balance_after.unwrap_or(0) == self.stored_balance
    }
}

/// Recompute the running sum of `entries` (oldest first).
pub fn audit_ledger(entries: &[LedgerEntry], stored_balance: i64) -> LedgerAudit {
    let mut running = 0i64;
    let mut first_mismatch = None;
    for entry in entries {
        running = running.saturating_add(entry.amount);
        if first_mismatch.is_none() && entry.balance_after != running {
            first_mismatch = Some(entry.id);
        }
    }
    LedgerAudit {
        entries: entries.len(),
        ledger_sum: running,
        stored_balance,
        latest_balance_after: entries.last().map(|e| e.balance_after),
        first_mismatch,
    }
}
