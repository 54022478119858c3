use std::sync::Arc;

use axum::{debug_handler, extract::{Path, State}, http::StatusCode, response::{IntoResponse, Response}, Json};
use tower_sessions::Session;

use crate::{
    chat::Chat,
    model::{ConversationRef, GroupId, UserId},
    session::authenticated,
    AppResult,
};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn direct_history(
    State(chat): State<Arc<Chat>>,
    session: Session,
    Path(user_id): Path<i64>,
) -> AppResult<Response> {
    history(&chat, &session, ConversationRef::Direct { user_id: UserId(user_id) }).await
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn group_history(
    State(chat): State<Arc<Chat>>,
    session: Session,
    Path(group_id): Path<i64>,
) -> AppResult<Response> {
    history(&chat, &session, ConversationRef::Group { group_id: GroupId(group_id) }).await
}

async fn history(chat: &Chat, session: &Session, conversation: ConversationRef) -> AppResult<Response> {
    let Some(user_id) = authenticated(session).await? else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    let conversation = conversation.resolve(user_id)?;
    chat.store().authorize(&conversation, user_id).await?;

    let messages = chat.store().history(&conversation).await?.collect().await?;
    Ok(Json(messages).into_response())
}
