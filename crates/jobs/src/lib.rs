//! Video job domain module.
//!
//! The job record, its forward-only status machine, request validation and
//! the duration-based cost function. Deterministic logic only.

pub mod artifact;
pub mod job;
pub mod request;

pub use artifact::{ArtifactRef, ExternalJobId};
pub use job::{ARTIFACT_RETENTION_HOURS, Job, JobStatus, artifact_retention};
pub use request::{DEFAULT_CFG, JobRequest, MAX_PROMPT_CHARS, VideoDuration};
