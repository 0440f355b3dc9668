//! RS256 verification against an identity provider's published key set.
//!
//! The key set is held in a time-boxed cache. A fetch happens when the cached
//! set is older than the configured TTL; concurrent refetches are harmless, so
//! no lock is held while fetching.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use tracing::{debug, warn};

use crate::claims::{AuthError, IdentityClaims, TokenVerifier, VerifiedIdentity};

/// Unknown `kid`s trigger an early refetch only if the cached set is at least
/// this old, so forged kids cannot hammer the provider.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct CachedKeys {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

#[derive(Debug)]
pub struct JwksCache {
    url: String,
    ttl: Duration,
    client: reqwest::Client,
    cached: RwLock<Option<CachedKeys>>,
}

impl JwksCache {
    pub fn new(url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            url: url.into(),
            ttl,
            client: reqwest::Client::new(),
            cached: RwLock::new(None),
        }
    }

    /// Cached key set if it is younger than `max_age`.
    fn cached_within(&self, max_age: Duration) -> Option<Arc<JwkSet>> {
        let guard = self.cached.read().ok()?;
        guard
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < max_age)
            .map(|c| Arc::clone(&c.keys))
    }

    async fn fetch(&self) -> Result<Arc<JwkSet>, AuthError> {
        debug!(url = %self.url, "fetching identity key set");
        let set = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?;

        let keys = Arc::new(set);
        match self.cached.write() {
            Ok(mut guard) => {
                *guard = Some(CachedKeys {
                    keys: Arc::clone(&keys),
                    fetched_at: Instant::now(),
                });
            }
            Err(_) => warn!("identity key cache lock poisoned; serving uncached keys"),
        }
        Ok(keys)
    }

    /// Current key set, refetching once the TTL has elapsed.
    pub async fn keys(&self) -> Result<Arc<JwkSet>, AuthError> {
        match self.cached_within(self.ttl) {
            Some(keys) => Ok(keys),
            None => self.fetch().await,
        }
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        let kid_owned = kid.map(str::to_owned);
        let kid = kid.ok_or(AuthError::UnknownKey(None))?;

        let keys = self.keys().await?;
        let jwk = match keys.find(kid) {
            Some(jwk) => jwk.clone(),
            None => {
                if self.cached_within(MIN_REFRESH_INTERVAL).is_some() {
                    return Err(AuthError::UnknownKey(kid_owned));
                }
                let refreshed = self.fetch().await?;
                refreshed
                    .find(kid)
                    .cloned()
                    .ok_or(AuthError::UnknownKey(kid_owned))?
            }
        };
        Ok(DecodingKey::from_jwk(&jwk)?)
    }
}

/// Verifies RS256 tokens issued by a fixed issuer.
#[derive(Debug)]
pub struct JwksVerifier {
    cache: JwksCache,
    validation: Validation,
}

impl JwksVerifier {
    pub fn new(cache: JwksCache, issuer: &str) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        Self { cache, validation }
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let header = decode_header(token)?;
        let key = self.cache.decoding_key(header.kid.as_deref()).await?;
        let data = decode::<IdentityClaims>(token, &key, &self.validation)?;
        Ok(data.claims.into())
    }
}
