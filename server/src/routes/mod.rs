//! HTTP route definitions.

mod health;

use axum::{routing::get, Router};

use crate::handlers::ws_handler;
use crate::AppState;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .route("/ws", get(ws_handler))
}
