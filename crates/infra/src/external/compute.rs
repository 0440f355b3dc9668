//! Compute backend client.
//!
//! Jobs are submitted as `POST {api_url}/{endpoint_id}/run` with a bearer key.
//! The backend answers with its own job id and later reports the outcome to
//! the callback endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use cineweave_core::JobId;
use cineweave_jobs::{ExternalJobId, Job};

use crate::config::ComputeConfig;

/// Parameters sent to the backend for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(skip)]
    pub job_id: JobId,
    pub prompt: String,
    pub duration_sec: u32,
    pub seed: Option<i64>,
    pub cfg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl From<&Job> for SubmitRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            prompt: job.prompt.clone(),
            duration_sec: job.duration_sec,
            seed: job.seed,
            cfg: job.cfg,
            image_url: job.image_url.clone(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ComputeError {
    #[error("compute backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("compute backend error ({0}): {1}")]
    Api(u16, String),
    #[error("unexpected compute backend response: {0}")]
    Parse(String),
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Hand the job to the backend. Errors on timeout or any non-2xx answer.
    async fn submit(&self, request: &SubmitRequest) -> Result<ExternalJobId, ComputeError>;
}

#[derive(Serialize)]
struct RunBody<'a> {
    input: &'a SubmitRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook: Option<&'a str>,
}

#[derive(Deserialize)]
struct RunResponse {
    id: String,
}

#[derive(Debug, Clone)]
pub struct HttpComputeBackend {
    client: reqwest::Client,
    run_url: String,
    api_key: String,
    timeout: Duration,
    callback_url: Option<String>,
}

impl HttpComputeBackend {
    pub fn new(config: &ComputeConfig) -> Result<Self, ComputeError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ComputeError::Network(e.to_string()))?;

        Ok(Self {
            client,
            run_url: format!(
                "{}/{}/run",
                config.api_url.trim_end_matches('/'),
                config.endpoint_id
            ),
            api_key: config.api_key.expose().to_string(),
            timeout: config.timeout,
            callback_url: config.callback_url.clone(),
        })
    }
}

#[async_trait]
impl ComputeBackend for HttpComputeBackend {
    #[instrument(skip_all, fields(job_id = %request.job_id), err)]
    async fn submit(&self, request: &SubmitRequest) -> Result<ExternalJobId, ComputeError> {
        let body = RunBody {
            input: request,
            webhook: self.callback_url.as_deref(),
        };

        let resp = self
            .client
            .post(&self.run_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ComputeError::Timeout(self.timeout)
                } else {
                    ComputeError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ComputeError::Api(status.as_u16(), text));
        }

        let run: RunResponse = resp
            .json()
            .await
            .map_err(|e| ComputeError::Parse(e.to_string()))?;
        let external = ExternalJobId::new(run.id).map_err(|e| ComputeError::Parse(e.to_string()))?;
        debug!(external_job_id = %external, "job accepted by compute backend");
        Ok(external)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, callback_url: Option<&str>) -> ComputeConfig {
        ComputeConfig {
            api_url: server.uri(),
            endpoint_id: "ep-123".to_string(),
            api_key: Secret::new("rp_key"),
            timeout: Duration::from_millis(500),
            callback_url: callback_url.map(str::to_owned),
        }
    }

    fn request() -> SubmitRequest {
        SubmitRequest {
            job_id: JobId::new(),
            prompt: "a lighthouse in fog".to_string(),
            duration_sec: 10,
            seed: Some(42),
            cfg: 7.5,
            image_url: None,
        }
    }

    #[tokio::test]
    async fn submit_posts_input_and_returns_backend_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ep-123/run"))
            .and(header("authorization", "Bearer rp_key"))
            .and(body_json(json!({
                "input": {"prompt": "a lighthouse in fog", "durationSec": 10, "seed": 42, "cfg": 7.5}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "rp-abc", "status": "IN_QUEUE"})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpComputeBackend::new(&config(&server, None)).unwrap();
        let id = backend.submit(&request()).await.unwrap();
        assert_eq!(id.as_str(), "rp-abc");
    }

    #[tokio::test]
    async fn callback_url_is_sent_as_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ep-123/run"))
            .and(body_json(json!({
                "input": {"prompt": "a lighthouse in fog", "durationSec": 10, "seed": 42, "cfg": 7.5},
                "webhook": "https://api.example/webhooks/compute-callback"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "rp-hook"})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpComputeBackend::new(&config(
            &server,
            Some("https://api.example/webhooks/compute-callback"),
        ))
        .unwrap();
        assert_eq!(backend.submit(&request()).await.unwrap().as_str(), "rp-hook");
    }

    #[tokio::test]
    async fn non_success_status_is_an_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("no workers"))
            .mount(&server)
            .await;

        let backend = HttpComputeBackend::new(&config(&server, None)).unwrap();
        match backend.submit(&request()).await {
            Err(ComputeError::Api(503, body)) => assert_eq!(body, "no workers"),
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "late"}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let backend = HttpComputeBackend::new(&config(&server, None)).unwrap();
        assert!(matches!(
            backend.submit(&request()).await,
            Err(ComputeError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn missing_id_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "IN_QUEUE"})))
            .mount(&server)
            .await;

        let backend = HttpComputeBackend::new(&config(&server, None)).unwrap();
        assert!(matches!(
            backend.submit(&request()).await,
            Err(ComputeError::Parse(_))
        ));
    }
}
