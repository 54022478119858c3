use std::{sync::Arc, time::Duration};

use axum::{
    debug_handler,
    extract::{ws::{CloseFrame, Message, WebSocket}, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_sessions::Session;

use crate::{
    chat::Chat,
    config::Config,
    model::UserId,
    protocol,
    session::authenticated,
    sessions::Outbound,
    AppResult, ChatError,
};

/// Close code for a connection refused because the session table is full.
const CLOSE_TRY_AGAIN: u16 = 1013;
/// Close code for any other refusal after the upgrade.
const CLOSE_INTERNAL: u16 = 1011;

fn refusal_code(err: &ChatError) -> u16 {
    match err {
        ChatError::ResourceExhausted { .. } => CLOSE_TRY_AGAIN,
        _ => CLOSE_INTERNAL,
    }
}

#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    State(chat): State<Arc<Chat>>,
    State(config): State<Arc<Config>>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let Some(user_id) = authenticated(&session).await? else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    let queue = config.session_queue;
    let push_timeout = config.push_timeout();
    Ok(ws.on_upgrade(move |socket| run_session(socket, chat, user_id, queue, push_timeout)))
}

async fn run_session(mut socket: WebSocket, chat: Arc<Chat>, user_id: UserId, queue: usize, push_timeout: Duration) {
    let (tx, mut rx) = mpsc::channel::<Outbound>(queue);

    let ctx = match chat.connect(user_id, tx).await {
        Ok(ctx) => ctx,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "refusing connection");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: refusal_code(&err),
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };
    let session_id = ctx.session_id;

    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let (frame, closing) = match outbound {
                Outbound::Event(event) => match event.to_json() {
                    Ok(json) => (Message::Text(json.into()), false),
                    Err(err) => {
                        tracing::warn!(session_id = %session_id, error = %err, "unencodable event");
                        continue;
                    }
                },
                Outbound::Close { code, reason } => (Message::Close(Some(CloseFrame { code, reason: reason.into() })), true),
            };

            match tokio::time::timeout(push_timeout, sender.send(frame)).await {
                Ok(Ok(())) if !closing => {}
                Ok(Ok(())) => break,
                Ok(Err(err)) => {
                    tracing::debug!(session_id = %session_id, error = %err, "socket send failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(session_id = %session_id, "socket send timed out");
                    break;
                }
            }
        }
    });

    let reader = async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => protocol::handle_frame(&chat, &ctx, text.as_str()).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = reader => {},
        _ = &mut writer => {},
    };

    writer.abort();
    chat.disconnect(session_id);
}
