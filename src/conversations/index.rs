use std::sync::Arc;

use axum::{debug_handler, extract::State, http::StatusCode, response::{IntoResponse, Response}, Json};
use tower_sessions::Session;

use crate::{chat::Chat, session::authenticated, AppResult};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn overview(State(chat): State<Arc<Chat>>, session: Session) -> AppResult<Response> {
    let Some(user_id) = authenticated(&session).await? else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    Ok(Json(chat.overview(user_id).await?).into_response())
}
