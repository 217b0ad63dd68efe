mod decisions;
mod events;
mod tasks;

use axum::routing::{get, patch, post};
use axum::Router;

use crate::SharedState;

/// Builds the REST portion of the router; `/ws` is attached separately in
/// [`crate::build_router`] since it isn't state-scoped the same way.
pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(tasks::list).post(tasks::create))
        .route(
            "/tasks/{id}",
            get(tasks::get).patch(tasks::update).delete(tasks::delete),
        )
        .route("/tasks/{id}/state", get(tasks::state))
        .route("/tasks/{id}/run", post(tasks::run))
        .route("/tasks/{id}/pause", post(tasks::pause))
        .route("/tasks/{id}/rewind", post(tasks::rewind))
        .route("/tasks/{id}/finalize", post(tasks::finalize))
        .route("/tasks/{id}/events", get(events::for_task))
        .route("/events", get(events::query))
        .route("/decisions", get(decisions::list_pending))
        .route("/decisions/{id}/resolve", patch(decisions::resolve))
}

async fn health() -> &'static str {
    "ok"
}
