use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::SharedState;
use crate::{handlers, ws};

/// Build the application router over shared server state.
pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/device-keys", post(handlers::publish_device_keys))
        .route("/device-keys/{user_id}", get(handlers::fetch_device_keys))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}
