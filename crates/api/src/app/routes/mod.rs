use axum::{
    routing::{get, post},
    Router,
};

pub mod credits;
pub mod jobs;
pub mod system;
pub mod users;
pub mod webhooks;

/// Router for all authenticated (caller-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/credits", credits::router())
        .route("/users/init", post(users::init_user))
        .route("/whoami", get(system::whoami))
}

/// Endpoints that carry no bearer token.
pub fn public_router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/plans", get(system::plans))
        .route("/webhooks/compute-callback", post(webhooks::compute_callback))
}
