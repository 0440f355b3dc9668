use core::fmt;

use serde::{Deserialize, Serialize};

use cineweave_core::DomainError;

/// Identifier assigned to a job by the external compute backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalJobId(String);

impl ExternalJobId {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("external job id cannot be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a stored output artifact, as reported by the compute backend.
///
/// Either a bare object key or a full URL to the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("artifact reference cannot be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object key used when issuing a download link.
    ///
    /// URLs map to `outputs/<last path segment>`; anything else is already a key.
    pub fn object_key(&self) -> String {
        let raw = self.0.as_str();
        if !(raw.starts_with("http://") || raw.starts_with("https://")) {
            return raw.to_string();
        }
        let path = raw.split(['?', '#']).next().unwrap_or(raw);
        let segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
        format!("outputs/{segment}")
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_artifacts_map_to_output_keys() {
        let r = ArtifactRef::new("https://bucket.r2.dev/outputs/abc123.mp4?x=1").unwrap();
        assert_eq!(r.object_key(), "outputs/abc123.mp4");
    }

    #[test]
    fn bare_keys_are_used_verbatim() {
        let r = ArtifactRef::new("renders/2024/abc.mp4").unwrap();
        assert_eq!(r.object_key(), "renders/2024/abc.mp4");
    }

    #[test]
    fn blank_values_are_rejected() {
        assert!(ArtifactRef::new("  ").is_err());
        assert!(ExternalJobId::new("").is_err());
    }
}
