mod history;
mod index;
mod read;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index::overview))
        .route("/direct/{user_id}", get(history::direct_history))
        .route("/group/{group_id}", get(history::group_history))
        .route("/direct/{user_id}/read", post(read::direct_read))
        .route("/group/{group_id}/read", post(read::group_read))
}
