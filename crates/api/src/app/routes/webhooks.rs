use std::sync::Arc;

use axum::{body::Bytes, extract::Extension, http::HeaderMap, Json};

use crate::app::dto::CallbackAck;
use crate::app::errors::ApiError;
use crate::app::services::AppServices;

pub const SIGNATURE_HEADER: &str = "x-compute-signature";

/// Compute backend callback. The signature covers the raw body, so the body is
/// taken as bytes and parsed only after verification.
pub async fn compute_callback(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackAck>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = services.callbacks.process(&body, signature).await?;
    Ok(Json(outcome.into()))
}
