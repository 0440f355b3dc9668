//! Request validation for new jobs.

use serde::{Deserialize, Serialize};

use cineweave_core::{DomainError, DomainResult};

/// Guidance scale used when the request does not carry one.
pub const DEFAULT_CFG: f64 = 7.5;

pub const MAX_PROMPT_CHARS: usize = 500;

const CFG_RANGE: core::ops::RangeInclusive<f64> = 1.0..=20.0;

/// Supported video lengths.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum VideoDuration {
    Five,
    Ten,
    Fifteen,
}

impl VideoDuration {
    pub fn secs(&self) -> u32 {
        match self {
            VideoDuration::Five => 5,
            VideoDuration::Ten => 10,
            VideoDuration::Fifteen => 15,
        }
    }

    /// Credits charged for a video of this length: one credit per 5 seconds.
    pub fn credit_cost(&self) -> i64 {
        i64::from(self.secs() / 5)
    }
}

impl TryFrom<u32> for VideoDuration {
    type Error = DomainError;

    fn try_from(secs: u32) -> Result<Self, Self::Error> {
        match secs {
            5 => Ok(VideoDuration::Five),
            10 => Ok(VideoDuration::Ten),
            15 => Ok(VideoDuration::Fifteen),
            other => Err(DomainError::validation(format!(
                "duration must be 5, 10, or 15 seconds, got {other}"
            ))),
        }
    }
}

impl From<VideoDuration> for u32 {
    fn from(value: VideoDuration) -> Self {
        value.secs()
    }
}

/// A validated request to generate a video.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub prompt: String,
    pub duration: VideoDuration,
    pub image_url: Option<String>,
    pub seed: Option<i64>,
    pub cfg: f64,
}

impl JobRequest {
    pub fn new(
        prompt: impl Into<String>,
        duration_sec: u32,
        image_url: Option<String>,
        seed: Option<i64>,
        cfg: Option<f64>,
    ) -> DomainResult<Self> {
        let prompt = prompt.into();
        let chars = prompt.chars().count();
        if chars == 0 {
            return Err(DomainError::validation("prompt cannot be empty"));
        }
        if chars > MAX_PROMPT_CHARS {
            return Err(DomainError::validation(format!(
                "prompt must be at most {MAX_PROMPT_CHARS} characters, got {chars}"
            )));
        }

        let duration = VideoDuration::try_from(duration_sec)?;

        let cfg = cfg.unwrap_or(DEFAULT_CFG);
        if !CFG_RANGE.contains(&cfg) {
            return Err(DomainError::validation(format!(
                "cfg must be between 1.0 and 20.0, got {cfg}"
            )));
        }

        let image_url = image_url.filter(|u| !u.trim().is_empty());

        Ok(Self {
            prompt,
            duration,
            image_url,
            seed,
            cfg,
        })
    }

    pub fn credit_cost(&self) -> i64 {
        self.duration.credit_cost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_minimal_request_with_defaults() {
        let req = JobRequest::new("a cat surfing", 10, None, None, None).unwrap();
        assert_eq!(req.cfg, DEFAULT_CFG);
        assert_eq!(req.credit_cost(), 2);
    }

    #[test]
    fn rejects_bad_prompt_lengths() {
        assert!(JobRequest::new("", 5, None, None, None).is_err());
        let long = "x".repeat(MAX_PROMPT_CHARS + 1);
        assert!(JobRequest::new(long, 5, None, None, None).is_err());
        let exact = "é".repeat(MAX_PROMPT_CHARS);
        assert!(JobRequest::new(exact, 5, None, None, None).is_ok());
    }

    #[test]
    fn rejects_out_of_range_cfg() {
        assert!(JobRequest::new("p", 5, None, None, Some(0.5)).is_err());
        assert!(JobRequest::new("p", 5, None, None, Some(20.5)).is_err());
        assert!(JobRequest::new("p", 5, None, None, Some(f64::NAN)).is_err());
        assert!(JobRequest::new("p", 5, None, None, Some(20.0)).is_ok());
    }

    #[test]
    fn blank_image_url_is_dropped() {
        let req = JobRequest::new("p", 5, Some("  ".to_string()), Some(42), None).unwrap();
        assert_eq!(req.image_url, None);
        assert_eq!(req.seed, Some(42));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: only 5, 10 and 15 seconds are accepted, and the cost is
        /// the duration divided by five.
        #[test]
        fn duration_cost_is_linear(secs in 0u32..100) {
            match VideoDuration::try_from(secs) {
                Ok(d) => {
                    prop_assert!(matches!(secs, 5 | 10 | 15));
                    prop_assert_eq!(d.credit_cost(), i64::from(secs / 5));
                }
                Err(_) => prop_assert!(!matches!(secs, 5 | 10 | 15)),
            }
        }
    }
}
