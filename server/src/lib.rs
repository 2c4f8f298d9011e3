//! Stow Relay - carries committed change broadcasts between processes.
//!
//! The relay is a WebSocket hub. Each client joins the database names it has
//! open and publishes the envelopes of its committed writes; the relay
//! forwards every envelope to the other connections joined to the same
//! database. [`RelayTransport`] is the matching client, usable as the
//! broadcast transport of a `stow_engine::Database`:
//!
//! ```ignore
//! let transport = Arc::new(RelayTransport::connect("ws://127.0.0.1:4000/ws").await?);
//! let db = Database::open("app", OpenOptions::new().broadcast(transport)).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
mod handlers;
mod routes;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use client::RelayTransport;
pub use config::{Config, ConfigError};
pub use error::{RelayError, Result};
pub use websocket::{ClientMessage, ConnectionManager, ServerMessage};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    /// Fresh state with no connections.
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }
}

/// Build the relay router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the relay on an already bound listener until the task is dropped.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "relay listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
