//! Wire events exchanged with a connected session and the single dispatch
//! point for inbound ones.
//!
//! Frames are JSON objects of the shape `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;

use crate::{
    chat::{Chat, SessionContext},
    model::{Conversation, ConversationRef, Draft, GroupId, MediaKind, Message, MessageId, UserId},
    ChatError,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage {
        conversation: ConversationRef,
        content: String,
        #[serde(default)]
        media_type: MediaKind,
        #[serde(default)]
        media_url: Option<String>,
    },
    SetTyping {
        conversation: ConversationRef,
        active: bool,
    },
    MarkRead {
        conversation: ConversationRef,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::SetTyping { .. } => "set_typing",
            Self::MarkRead { .. } => "mark_read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(MessagePayload),
    UserStatus {
        user_id: UserId,
        online: bool,
    },
    UserTyping {
        user_id: UserId,
        username: String,
        conversation: ConversationRef,
    },
    UserStopTyping {
        user_id: UserId,
        conversation: ConversationRef,
    },
    Error {
        event: String,
        kind: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(event: &str, err: &ChatError) -> Self {
        Self::Error {
            event: event.to_owned(),
            kind: err.kind().to_owned(),
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A message as pushed to recipients.
///
/// Direct messages carry `recipient_id`, group messages carry `group_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    pub media_type: MediaKind,
    pub media_url: Option<String>,
    pub timestamp: String,
    pub read: bool,
    pub sender_name: String,
}

impl MessagePayload {
    pub fn new(message: &Message, sender_name: &str) -> Self {
        let (recipient_id, group_id) = match message.conversation {
            Conversation::Direct { .. } => (message.conversation.peer_of(message.sender_id), None),
            Conversation::Group { group_id } => (None, Some(group_id)),
        };

        Self {
            id: message.id,
            sender_id: message.sender_id,
            recipient_id,
            group_id,
            content: message.content.clone(),
            media_type: message.media_type,
            media_url: message.media_url.clone(),
            timestamp: message
                .timestamp
                .format(&Rfc3339)
                .unwrap_or_else(|_| message.timestamp.to_string()),
            read: message.read,
            sender_name: sender_name.to_owned(),
        }
    }
}

/// How `viewer` should see `conversation` on the wire.
pub fn conversation_ref_for(conversation: &Conversation, viewer: UserId) -> ConversationRef {
    match *conversation {
        Conversation::Group { group_id } => ConversationRef::Group { group_id },
        Conversation::Direct { high, .. } => ConversationRef::Direct {
            user_id: conversation.peer_of(viewer).unwrap_or(high),
        },
    }
}

/// Parse a raw text frame and route it. Failures are reported back to the
/// originating session as an `error` event; nothing here fails the
/// connection.
pub async fn handle_frame(chat: &Chat, ctx: &SessionContext, frame: &str) {
    let event = match serde_json::from_str::<ClientEvent>(frame) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(session_id = %ctx.session_id, error = %err, "undecodable frame");
            chat.reply(ctx, ServerEvent::error("unknown", &ChatError::invalid(err.to_string())));
            return;
        }
    };

    let name = event.name();
    if let Err(err) = dispatch(chat, ctx, event).await {
        tracing::info!(
            session_id = %ctx.session_id,
            user_id = %ctx.user.id,
            event = name,
            error = %err,
            "request rejected"
        );
        chat.reply(ctx, ServerEvent::error(name, &err));
    }
}

pub async fn dispatch(chat: &Chat, ctx: &SessionContext, event: ClientEvent) -> Result<(), ChatError> {
    match event {
        ClientEvent::SendMessage { conversation, content, media_type, media_url } => {
            let conversation = conversation.resolve(ctx.user.id)?;
            let draft = Draft { content, media_kind: media_type, media_url };
            chat.router().send(ctx, &conversation, draft).await?;
        }
        ClientEvent::SetTyping { conversation, active } => {
            let conversation = conversation.resolve(ctx.user.id)?;
            chat.typing().set_typing(ctx, &conversation, active).await?;
        }
        ClientEvent::MarkRead { conversation } => {
            let conversation = conversation.resolve(ctx.user.id)?;
            chat.store().mark_read(&conversation, ctx.user.id).await?;
        }
    }
    Ok(())
}
