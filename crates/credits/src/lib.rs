//! Credit domain module.
//!
//! Balance arithmetic, ledger entries and the plan catalog, implemented purely
//! as deterministic domain logic (no IO, no HTTP, no storage). Stores in the
//! infra crate apply [`CreditMutation`]s atomically and persist the resulting
//! [`LedgerEntry`].

pub mod ledger;
pub mod plan;
pub mod user;

pub use ledger::{
    CreditError, CreditMutation, LedgerAudit, LedgerEntry, LedgerEntryKind, audit_ledger,
};
pub use plan::{Plan, PlanTier, plan_catalog};
pub use user::User;
