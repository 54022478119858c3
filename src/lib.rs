pub mod appresult;
pub mod chat;
pub mod config;
pub mod conversations;
pub mod db;
pub mod error;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod sessions;
pub mod store;
pub mod typing;
pub mod ws;

use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};
use tower_http::cors::CorsLayer;

pub use appresult::{AppError, AppResult};
pub use chat::{Chat, SessionContext};
pub use config::Config;
pub use error::{ChatError, ChatResult};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub chat: Arc<Chat>,
    pub config: Arc<Config>,
}

/// Every route the service exposes, minus the HTTP session layer which the
/// caller supplies.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::chat_ws))
        .nest("/c", conversations::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
