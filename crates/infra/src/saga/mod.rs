//! The job saga: admission and billing, callback settlement, and the sweep
//! that repairs interrupted compensations.
//!
//! Flow:
//! 1. `JobOrchestrator::create_job` admits, reserves, and submits
//! 2. The backend reports back through `CallbackProcessor::process`
//! 3. Failure on either side ends in `failed` plus one compensating refund
//!
//! `Reconciler` settles failed jobs whose refund never landed.

pub mod callback;
pub mod orchestrator;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod testing;

pub use callback::{CallbackError, CallbackOutcome, CallbackPayload, CallbackProcessor};
pub use orchestrator::{JobAdmission, JobOrchestrator, OrchestratorError};
pub use reconcile::{ReconcileReport, Reconciler};
