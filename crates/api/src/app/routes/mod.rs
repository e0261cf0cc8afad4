use axum::Router;

pub mod events;
pub mod jobs;
pub mod system;

pub fn router() -> Router {
    Router::new().merge(jobs::router()).merge(events::router())
}
