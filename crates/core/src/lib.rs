//! `cineweave-core`: shared domain building blocks.
//!
//! Pure types only: identifiers and the domain error model.
//! Nothing in this crate performs IO.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, LedgerEntryId, UserId};
