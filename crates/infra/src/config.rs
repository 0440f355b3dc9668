//! Configuration loading from the process environment.
//!
//! Every variable is read once at startup. Empty values count as unset.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// A secret string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: Secret,
    pub max_connections: u32,
}

/// How bearer tokens are verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityConfig {
    /// RS256 against a published key set.
    Jwks {
        url: String,
        issuer: String,
        cache_ttl: Duration,
    },
    /// HS256 with a shared secret (development and tests).
    SharedSecret { secret: Secret },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeConfig {
    pub api_url: String,
    pub endpoint_id: String,
    pub api_key: Secret,
    pub timeout: Duration,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint_url: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: Secret,
    pub path_style: bool,
}

/// Where download links come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Presigned(S3Config),
    Public { base_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: String,
    pub app_base_url: String,
    /// `Some` when persistent (Postgres) stores are selected.
    pub database: Option<DatabaseConfig>,
    pub max_concurrent_jobs_per_user: usize,
    pub welcome_credits: i64,
    pub identity: IdentityConfig,
    pub compute: ComputeConfig,
    pub webhook_secret: Secret,
    pub storage: StorageConfig,
    pub download_link_ttl: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let database = if env.parse_or("USE_PERSISTENT_STORES", false)? {
            Some(DatabaseConfig {
                url: Secret::new(env.required("DATABASE_URL")?),
                max_connections: env.parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
            })
        } else {
            None
        };

        let identity = match (env.get("IDENTITY_JWKS_URL"), env.get("IDENTITY_ISSUER")) {
            (Some(url), Some(issuer)) => IdentityConfig::Jwks {
                url,
                issuer,
                cache_ttl: Duration::from_secs(env.parse_or("JWKS_CACHE_TTL_SECS", 300)?),
            },
            (Some(_), None) => return Err(ConfigError::Missing("IDENTITY_ISSUER")),
            (None, Some(_)) => return Err(ConfigError::Missing("IDENTITY_JWKS_URL")),
            (None, None) => {
                let secret = env.get("JWT_SECRET").unwrap_or_else(|| {
                    warn!("JWT_SECRET not set; using insecure dev default");
                    DEV_JWT_SECRET.to_string()
                });
                IdentityConfig::SharedSecret {
                    secret: Secret::new(secret),
                }
            }
        };

        let compute = ComputeConfig {
            api_url: env
                .get("COMPUTE_API_URL")
                .unwrap_or_else(|| "https://api.runpod.ai/v2".to_string()),
            endpoint_id: env.required("COMPUTE_ENDPOINT_ID")?,
            api_key: Secret::new(env.required("COMPUTE_API_KEY")?),
            timeout: Duration::from_secs(env.parse_or("COMPUTE_TIMEOUT_SECS", 30)?),
            callback_url: env.get("COMPUTE_CALLBACK_URL"),
        };

        let storage = match (
            env.get("STORAGE_ENDPOINT_URL"),
            env.get("STORAGE_BUCKET"),
            env.get("STORAGE_ACCESS_KEY_ID"),
            env.get("STORAGE_SECRET_ACCESS_KEY"),
        ) {
            (Some(endpoint_url), Some(bucket), Some(access_key_id), Some(secret)) => {
                StorageConfig::Presigned(S3Config {
                    endpoint_url,
                    bucket,
                    region: env.get("STORAGE_REGION").unwrap_or_else(|| "auto".to_string()),
                    access_key_id,
                    secret_access_key: Secret::new(secret),
                    path_style: env.parse_or("STORAGE_PATH_STYLE", true)?,
                })
            }
            _ => StorageConfig::Public {
                base_url: env
                    .get("STORAGE_PUBLIC_BASE_URL")
                    .unwrap_or_else(|| "http://localhost:9000".to_string()),
            },
        };

        let max_concurrent_jobs_per_user = env.parse_or("MAX_CONCURRENT_JOBS_PER_USER", 5)?;
        if max_concurrent_jobs_per_user == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_CONCURRENT_JOBS_PER_USER",
                reason: "must be at least 1".to_string(),
            });
        }

        let welcome_credits: i64 = env.parse_or("WELCOME_CREDITS", 80)?;
        if welcome_credits < 0 {
            return Err(ConfigError::Invalid {
                var: "WELCOME_CREDITS",
                reason: "must not be negative".to_string(),
            });
        }

        Ok(Self {
            bind_addr: env.parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            environment: env
                .get("ENVIRONMENT")
                .unwrap_or_else(|| "development".to_string()),
            app_base_url: env
                .get("APP_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            database,
            max_concurrent_jobs_per_user,
            welcome_credits,
            identity,
            compute,
            webhook_secret: Secret::new(env.required("WEBHOOK_SECRET")?),
            storage,
            download_link_ttl: Duration::from_secs(env.parse_or("DOWNLOAD_LINK_TTL_SECS", 86_400)?),
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: key,
                reason: format!("{raw:?}: {e}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("COMPUTE_ENDPOINT_ID", "ep-123"),
        ("COMPUTE_API_KEY", "rp_key"),
        ("WEBHOOK_SECRET", "whsec"),
    ];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let cfg = load(REQUIRED).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert_eq!(cfg.max_concurrent_jobs_per_user, 5);
        assert_eq!(cfg.welcome_credits, 80);
        assert_eq!(cfg.compute.timeout, Duration::from_secs(30));
        assert_eq!(cfg.download_link_ttl, Duration::from_secs(86_400));
        assert!(cfg.database.is_none());
        assert!(matches!(cfg.identity, IdentityConfig::SharedSecret { .. }));
        assert!(matches!(cfg.storage, StorageConfig::Public { .. }));
    }

    #[test]
    fn missing_required_var_is_named() {
        let err = load(&[("COMPUTE_ENDPOINT_ID", "ep"), ("COMPUTE_API_KEY", "k")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("WEBHOOK_SECRET"));
    }

    #[test]
    fn persistent_stores_need_a_database_url() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("USE_PERSISTENT_STORES", "true"));
        assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing("DATABASE_URL"));

        vars.push(("DATABASE_URL", "postgres://localhost/cineweave"));
        let cfg = load(&vars).unwrap();
        assert_eq!(cfg.database.unwrap().max_connections, 10);
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("MAX_CONCURRENT_JOBS_PER_USER", "lots"));
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { var: "MAX_CONCURRENT_JOBS_PER_USER", .. }
        ));
    }

    #[test]
    fn jwks_requires_issuer() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("IDENTITY_JWKS_URL", "https://idp.example/.well-known/jwks.json"));
        assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing("IDENTITY_ISSUER"));

        vars.push(("IDENTITY_ISSUER", "https://idp.example"));
        assert!(matches!(load(&vars).unwrap().identity, IdentityConfig::Jwks { .. }));
    }

    #[test]
    fn full_storage_credentials_select_presigning() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("STORAGE_ENDPOINT_URL", "https://acct.r2.cloudflarestorage.com"),
            ("STORAGE_BUCKET", "videos"),
            ("STORAGE_ACCESS_KEY_ID", "AKID"),
            ("STORAGE_SECRET_ACCESS_KEY", "secret"),
        ]);
        match load(&vars).unwrap().storage {
            StorageConfig::Presigned(s3) => {
                assert_eq!(s3.region, "auto");
                assert!(s3.path_style);
            }
            other => panic!("expected presigned storage, got {other:?}"),
        }
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let cfg = load(REQUIRED).unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("rp_key"));
        assert!(!rendered.contains("whsec"));
    }
}
