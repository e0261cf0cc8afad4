use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::app::dto::{JobView, SubmitJobBody, parse_job_id};
use crate::app::errors::submit_error_to_response;
use crate::app::services::AppServices;
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/retry", post(retry_job))
}

/// POST /jobs
///
/// 202 for a new submission; 200 when the same in-flight job id was already accepted.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<SubmitJobBody>,
) -> Response {
    let request = match body.into_request(user.user_id()) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match services.jobs.submit(request).await {
        Ok(submission) if submission.deduplicated => {
            (StatusCode::OK, Json(submission)).into_response()
        }
        Ok(submission) => (StatusCode::ACCEPTED, Json(submission)).into_response(),
        Err(e) => submit_error_to_response(e),
    }
}

/// POST /jobs/:job_id/retry
pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = match parse_job_id(job_id) {
        Ok(job_id) => job_id,
        Err(response) => return response,
    };

    match services.jobs.retry(user.user_id(), &job_id).await {
        Ok(submission) => (StatusCode::ACCEPTED, Json(submission)).into_response(),
        Err(e) => submit_error_to_response(e),
    }
}

/// GET /jobs/:job_id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = match parse_job_id(job_id) {
        Ok(job_id) => job_id,
        Err(response) => return response,
    };

    match services.jobs.status(user.user_id(), &job_id).await {
        Ok(job) => Json(JobView::from(job)).into_response(),
        Err(e) => submit_error_to_response(e),
    }
}
