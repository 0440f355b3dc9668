//! Clients for collaborators outside the process: the compute backend and
//! the blob store that serves finished artifacts.

pub mod compute;
pub mod storage;

pub use compute::{ComputeBackend, ComputeError, HttpComputeBackend, SubmitRequest};
pub use storage::{ArtifactLinkIssuer, PublicLinkIssuer, S3Presigner, StorageError};
