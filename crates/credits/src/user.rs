use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cineweave_core::UserId;

use crate::plan::PlanTier;

/// A credit account holder.
///
/// `credits` is only ever changed by applying a [`crate::CreditMutation`]
/// inside a store, together with the matching ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    /// Stable subject identifier from the identity provider.
    pub subject: String,
    pub email: Option<String>,
    pub plan: PlanTier,
    pub credits: i64,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// A fresh user with a zero balance. The welcome grant is applied separately
    /// so it lands in the ledger.
    pub fn new(subject: impl Into<String>, email: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: UserId::new(),
            subject: subject.into(),
            email,
            plan: PlanTier::Starter,
            credits: 0,
            created_at: now,
        }
    }
}
