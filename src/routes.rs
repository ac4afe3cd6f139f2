use axum::{routing::get, routing::post, Router};

use crate::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::websocket))
        .route("/moderate", post(handlers::moderate))
        .route("/filter", post(handlers::filter))
        .route("/decide", post(handlers::decide))
        .route("/templates", get(handlers::list_templates))
        .route("/simulate/start", post(handlers::simulate_start))
        .route("/simulate/stop", post(handlers::simulate_stop))
        .route("/health", get(handlers::health))
        .with_state(state)
}
