//! Job persistence.
//!
//! - `JobStore`: admission under a per-user cap and conditional status writes
//! - `InMemoryJobStore`: single-process store for tests/dev
//! - `PostgresJobStore`: durable store; admission serialized per user

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
