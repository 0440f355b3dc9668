//! `cineweave-auth`: authentication boundary.
//!
//! Identity-token verification for end users and shared-secret signature
//! verification for compute-backend callbacks. Decoupled from HTTP routing
//! and storage.

pub mod claims;
pub mod hs256;
pub mod jwks;
pub mod webhook;

pub use claims::{AuthError, IdentityClaims, TokenVerifier, VerifiedIdentity};
pub use hs256::Hs256Verifier;
pub use jwks::{JwksCache, JwksVerifier};
pub use webhook::{WebhookError, WebhookVerifier};
