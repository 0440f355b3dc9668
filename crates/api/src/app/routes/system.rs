use std::sync::Arc;

use axum::{extract::Extension, Json};

use cineweave_credits::plan_catalog;

use crate::app::dto::{HealthResponse, PlansResponse};
use crate::app::services::AppServices;
use crate::context::IdentityContext;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        environment: services.environment.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn plans() -> Json<PlansResponse> {
    Json(PlansResponse {
        plans: plan_catalog(),
    })
}

pub async fn whoami(Extension(identity): Extension<IdentityContext>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "subject": identity.subject(),
        "email": identity.email(),
    }))
}
