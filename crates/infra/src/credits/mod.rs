//! Credit balances and ledger persistence, plus the reservation service.

pub mod postgres;
pub mod service;
pub mod store;

pub use postgres::PostgresCreditStore;
pub use service::{CreditReservationService, Settlement};
pub use store::{CreditStore, CreditStoreError, InMemoryCreditStore};
