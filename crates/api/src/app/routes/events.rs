//! Per-user realtime stream over Server-Sent Events.

use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, routing::get, Router};

use crate::app::services::{self, AppServices};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new().route("/events", get(stream))
}

/// GET /events
///
/// Event names match the realtime channel: `job:progress`, `job:completed`,
/// `job:failed`, `notification`. Data is the event's JSON payload.
pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> impl IntoResponse {
    services::user_sse_stream(services, user.user_id())
}
