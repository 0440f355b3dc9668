//! HMAC-SHA256 signatures over raw callback bodies.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook secret rejected by MAC")]
    InvalidSecret,

    #[error("signature is not valid hex")]
    MalformedSignature,

    #[error("signature mismatch")]
    Mismatch,
}

/// Keyed verifier for compute-backend callbacks.
#[derive(Clone)]
pub struct WebhookVerifier {
    mac: HmacSha256,
}

impl WebhookVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, WebhookError> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|_| WebhookError::InvalidSecret)?;
        Ok(Self { mac })
    }

    /// Lowercase hex MAC of `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a hex signature (optionally prefixed with `sha256=`) in constant time.
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<(), WebhookError> {
        let signature = signature.trim();
        let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
        let expected = hex::decode(signature).map_err(|_| WebhookError::MalformedSignature)?;

        let mut mac = self.mac.clone();
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| WebhookError::Mismatch)
    }
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier").finish_non_exhaustive()
    }
}
