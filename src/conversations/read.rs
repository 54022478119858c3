use std::sync::Arc;

use axum::{debug_handler, extract::{Path, State}, http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use tower_sessions::Session;

use crate::{
    chat::Chat,
    model::{ConversationRef, GroupId, UserId},
    session::authenticated,
    AppResult,
};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn direct_read(
    State(chat): State<Arc<Chat>>,
    session: Session,
    Path(user_id): Path<i64>,
) -> AppResult<Response> {
    mark_read(&chat, &session, ConversationRef::Direct { user_id: UserId(user_id) }).await
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn group_read(
    State(chat): State<Arc<Chat>>,
    session: Session,
    Path(group_id): Path<i64>,
) -> AppResult<Response> {
    mark_read(&chat, &session, ConversationRef::Group { group_id: GroupId(group_id) }).await
}

async fn mark_read(chat: &Chat, session: &Session, conversation: ConversationRef) -> AppResult<Response> {
    let Some(reader) = authenticated(session).await? else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    let conversation = conversation.resolve(reader)?;
    let updated = chat.store().mark_read(&conversation, reader).await?;

    Ok(Json(json!({ "updated": updated })).into_response())
}
