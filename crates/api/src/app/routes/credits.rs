use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    routing::get,
    Json, Router,
};

use crate::app::dto::{
    CreditHistoryResponse, CreditsResponse, DEFAULT_HISTORY_LIMIT, LimitQuery, MAX_HISTORY_LIMIT,
};
use crate::app::errors::ApiError;
use crate::app::routes::users::current_user;
use crate::app::services::AppServices;
use crate::context::IdentityContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(get_credits))
        .route("/history", get(credit_history))
}

pub async fn get_credits(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(identity): Extension<IdentityContext>,
) -> Result<Json<CreditsResponse>, ApiError> {
    let user = current_user(&services, &identity).await?;
    Ok(Json(CreditsResponse {
        credits: user.credits,
        plan: user.plan,
        plan_details: user.plan.details(),
    }))
}

pub async fn credit_history(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(identity): Extension<IdentityContext>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<CreditHistoryResponse>, ApiError> {
    let user = current_user(&services, &identity).await?;
    let limit = query.resolve(DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT);
    let entries = services.credits.history(user.id, limit).await?;
    Ok(Json(CreditHistoryResponse {
        user_id: user.id,
        entries,
    }))
}
