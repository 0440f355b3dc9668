use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    routing::{get, post},
    Json, Router,
};

use cineweave_core::JobId;
use cineweave_jobs::JobRequest;

use crate::app::dto::{
    CreateJobRequest, CreateJobResponse, DEFAULT_JOB_LIMIT, JobView, LimitQuery, MAX_JOB_LIMIT,
};
use crate::app::errors::ApiError;
use crate::app::routes::users::current_user;
use crate::app::services::AppServices;
use crate::context::IdentityContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/create", post(create_job))
        .route("/:id", get(get_job))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(identity): Extension<IdentityContext>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let request = JobRequest::try_from(body)?;

    let user = current_user(&services, &identity).await?;
    let admission = services.orchestrator.create_job(user.id, request).await?;
    Ok(Json(admission.into()))
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(identity): Extension<IdentityContext>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    // An id that cannot exist is reported like any other unknown job.
    let job_id: JobId = id.parse().map_err(|_| ApiError::JobNotFound)?;

    let user = current_user(&services, &identity).await?;
    let job = services.orchestrator.get_job(user.id, job_id).await?;
    let download_url = services.download_url(&job);
    Ok(Json(JobView::new(job, download_url)))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(identity): Extension<IdentityContext>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let user = current_user(&services, &identity).await?;
    let limit = query.resolve(DEFAULT_JOB_LIMIT, MAX_JOB_LIMIT);
    let jobs = services.orchestrator.list_jobs(user.id, limit).await?;
    Ok(Json(jobs.into_iter().map(|job| JobView::new(job, None)).collect()))
}
