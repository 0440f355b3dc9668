use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use cineweave_core::DomainError;
use cineweave_infra::credits::CreditStoreError;
use cineweave_infra::saga::{CallbackError, OrchestratorError};
use cineweave_credits::CreditError;

/// Every failure a request can end in.
///
/// Each kind maps to a fixed status and machine-readable code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthenticated(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("user not found")]
    UserNotFound,

    #[error("job not found")]
    JobNotFound,

    #[error("job belongs to another user")]
    AccessDenied,

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("concurrency limit reached: {limit} jobs already active")]
    ConcurrencyLimitExceeded { limit: usize },

    #[error("job submission failed")]
    SubmissionFailed,

    #[error("{0}")]
    Validation(String),

    /// Logged in full, reported without detail.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::UserNotFound | Self::JobNotFound => StatusCode::NOT_FOUND,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::ConcurrencyLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::SubmissionFailed | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::InvalidSignature => "invalid_signature",
            Self::UserNotFound => "user_not_found",
            Self::JobNotFound => "job_not_found",
            Self::AccessDenied => "access_denied",
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::ConcurrencyLimitExceeded { .. } => "concurrency_limit_exceeded",
            Self::SubmissionFailed => "submission_failed",
            Self::Validation(_) => "validation_error",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Internal(detail) => {
                error!(error = %detail, "request failed with internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        json_error(self.status(), self.code(), message)
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CreditStoreError> for ApiError {
    fn from(err: CreditStoreError) -> Self {
        match err {
            CreditStoreError::UserNotFound(_) => Self::UserNotFound,
            CreditStoreError::Rejected(CreditError::InsufficientCredits { required, available }) => {
                Self::InsufficientCredits { required, available }
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::UserNotFound(_) => Self::UserNotFound,
            OrchestratorError::JobNotFound(_) => Self::JobNotFound,
            OrchestratorError::AccessDenied(_) => Self::AccessDenied,
            OrchestratorError::InsufficientCredits { required, available } => {
                Self::InsufficientCredits { required, available }
            }
            OrchestratorError::ConcurrencyLimitExceeded { limit, .. } => {
                Self::ConcurrencyLimitExceeded { limit }
            }
            OrchestratorError::SubmissionFailed(detail) => {
                error!(error = %detail, "job submission failed");
                Self::SubmissionFailed
            }
            OrchestratorError::Credits(e) => e.into(),
            OrchestratorError::Jobs(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<CallbackError> for ApiError {
    fn from(err: CallbackError) -> Self {
        match err {
            CallbackError::InvalidSignature => Self::InvalidSignature,
            CallbackError::MalformedPayload(msg) => Self::Validation(msg),
            CallbackError::Jobs(e) => Self::Internal(e.to_string()),
            CallbackError::Credits(e) => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cineweave_core::{JobId, UserId};

    #[test]
    fn orchestrator_errors_map_to_stable_codes() {
        let cases = [
            (OrchestratorError::UserNotFound(UserId::new()), StatusCode::NOT_FOUND, "user_not_found"),
            (OrchestratorError::AccessDenied(JobId::new()), StatusCode::FORBIDDEN, "access_denied"),
            (
                OrchestratorError::InsufficientCredits { required: 3, available: 1 },
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
            ),
            (
                OrchestratorError::ConcurrencyLimitExceeded { active: 5, limit: 5 },
                StatusCode::TOO_MANY_REQUESTS,
                "concurrency_limit_exceeded",
            ),
            (
                OrchestratorError::SubmissionFailed("503".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "submission_failed",
            ),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status(), status);
            assert_eq!(api.code(), code);
        }
    }

    #[test]
    fn internal_errors_hide_detail() {
        let api = ApiError::from(CallbackError::Credits(CreditStoreError::Storage(
            "connection reset by 10.0.0.7".to_string(),
        )));
        assert_eq!(api.code(), "internal");
        assert_eq!(api.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn validation_failures_are_bad_requests() {
        let api = ApiError::from(DomainError::validation("prompt cannot be empty"));
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);
        assert_eq!(api.to_string(), "prompt cannot be empty");
    }
}
