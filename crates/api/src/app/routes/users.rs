use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use cineweave_credits::User;

use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::IdentityContext;

/// Get-or-create the caller's user. Creation grants the welcome credits.
pub async fn init_user(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(identity): Extension<IdentityContext>,
) -> Result<impl IntoResponse, ApiError> {
    let (user, created) = services
        .credits
        .ensure_user(identity.subject(), identity.email())
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(user)))
}

/// The caller's user record; `UserNotFound` until `/users/init` has run.
pub(crate) async fn current_user(
    services: &AppServices,
    identity: &IdentityContext,
) -> Result<User, ApiError> {
    services
        .credits
        .user_by_subject(identity.subject())
        .await?
        .ok_or(ApiError::UserNotFound)
}
