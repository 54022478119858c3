//! Append-only message record plus the collaborator interfaces it persists
//! through.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, Stream, TryStreamExt};
use time::OffsetDateTime;

use crate::{
    model::{now_millis, Conversation, Draft, Group, GroupId, Message, MessageId, User, UserId},
    ChatError, ChatResult,
};

/// A message about to be written. The log assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation: Conversation,
    pub sender_id: UserId,
    pub draft: Draft,
    pub timestamp: OffsetDateTime,
}

/// Durable ordered log of messages.
///
/// `insert` must be atomic and must hand out ids that are strictly increasing
/// across calls.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn insert(&self, message: &NewMessage) -> ChatResult<MessageId>;

    /// Messages with `after < id <= up_to`, ascending, at most `limit`.
    async fn query(
        &self,
        conversation: &Conversation,
        after: Option<MessageId>,
        up_to: MessageId,
        limit: u32,
    ) -> ChatResult<Vec<Message>>;

    async fn latest_id(&self, conversation: &Conversation) -> ChatResult<Option<MessageId>>;

    /// Flag as read every unread message sent before `before` by anyone but
    /// `exclude_sender`. Returns how many changed.
    async fn update_read_flags(
        &self,
        conversation: &Conversation,
        before: OffsetDateTime,
        exclude_sender: UserId,
    ) -> ChatResult<u64>;
}

/// Identity and membership data owned outside the core.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_user(&self, user_id: UserId) -> ChatResult<Option<User>>;

    /// `None` when the group does not exist.
    async fn group_members(&self, group_id: GroupId) -> ChatResult<Option<Vec<UserId>>>;

    async fn touch_last_seen(&self, user_id: UserId, at: OffsetDateTime) -> ChatResult<()>;

    /// Every known user, by id.
    async fn list_users(&self) -> ChatResult<Vec<User>>;

    /// Groups `user_id` is a member of, by id.
    async fn groups_of(&self, user_id: UserId) -> ChatResult<Vec<Group>>;
}

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct MessageStore {
    log: Arc<dyn MessageLog>,
    directory: Arc<dyn Directory>,
    page_size: u32,
}

impl MessageStore {
    pub fn new(log: Arc<dyn MessageLog>, directory: Arc<dyn Directory>) -> Self {
        Self { log, directory, page_size: DEFAULT_PAGE_SIZE }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub async fn participants(&self, conversation: &Conversation) -> ChatResult<Vec<UserId>> {
        match *conversation {
            Conversation::Direct { low, high } => {
                for user_id in [low, high] {
                    if self.directory.find_user(user_id).await?.is_none() {
                        return Err(ChatError::not_found("user", user_id));
                    }
                }
                Ok(vec![low, high])
            }
            Conversation::Group { group_id } => self
                .directory
                .group_members(group_id)
                .await?
                .ok_or_else(|| ChatError::not_found("group", group_id)),
        }
    }

    /// Participants of `conversation`, provided `user_id` is one of them.
    pub async fn authorize(&self, conversation: &Conversation, user_id: UserId) -> ChatResult<Vec<UserId>> {
        let participants = self.participants(conversation).await?;
        if !participants.contains(&user_id) {
            return Err(ChatError::Unauthorized {
                user_id: user_id.0,
                conversation: conversation.key(),
            });
        }
        Ok(participants)
    }

    pub async fn append(&self, conversation: &Conversation, sender_id: UserId, draft: Draft) -> ChatResult<Message> {
        Ok(self.commit(conversation, sender_id, draft).await?.0)
    }

    /// Append and hand back the participants resolved while validating.
    pub(crate) async fn commit(
        &self,
        conversation: &Conversation,
        sender_id: UserId,
        draft: Draft,
    ) -> ChatResult<(Message, Vec<UserId>)> {
        if draft.content.trim().is_empty() && draft.media_url.is_none() {
            return Err(ChatError::invalid("message has neither content nor media"));
        }
        let participants = self.authorize(conversation, sender_id).await?;

        let new_message = NewMessage {
            conversation: *conversation,
            sender_id,
            draft,
            timestamp: now_millis(),
        };
        let id = self.log.insert(&new_message).await?;

        let NewMessage { draft, timestamp, .. } = new_message;
        let message = Message {
            id,
            conversation: *conversation,
            sender_id,
            content: draft.content,
            media_type: draft.media_kind,
            media_url: draft.media_url,
            timestamp,
            read: false,
        };
        Ok((message, participants))
    }

    /// Everything in `conversation` up to now, oldest first.
    pub async fn history(&self, conversation: &Conversation) -> ChatResult<History> {
        let up_to = self.log.latest_id(conversation).await?;
        Ok(History {
            log: self.log.clone(),
            conversation: *conversation,
            up_to,
            page_size: self.page_size,
            cursor: None,
            exhausted: up_to.is_none(),
        })
    }

    pub async fn mark_read(&self, conversation: &Conversation, reader: UserId) -> ChatResult<u64> {
        self.authorize(conversation, reader).await?;
        let updated = self.log.update_read_flags(conversation, now_millis(), reader).await?;
        tracing::debug!(conversation = %conversation, reader = %reader, updated, "marked read");
        Ok(updated)
    }
}

/// Lazy, restartable walk over a conversation's messages.
///
/// The upper bound is fixed when the walk is created, so messages appended
/// afterwards are never yielded and the walk always ends.
pub struct History {
    log: Arc<dyn MessageLog>,
    conversation: Conversation,
    up_to: Option<MessageId>,
    page_size: u32,
    cursor: Option<MessageId>,
    exhausted: bool,
}

impl History {
    pub async fn next_page(&mut self) -> ChatResult<Option<Vec<Message>>> {
        let Some(up_to) = self.up_to else {
            return Ok(None);
        };
        if self.exhausted {
            return Ok(None);
        }

        let page = self.log.query(&self.conversation, self.cursor, up_to, self.page_size).await?;
        if (page.len() as u32) < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.cursor = Some(last.id);
                Ok(Some(page))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    pub fn restart(&mut self) {
        self.cursor = None;
        self.exhausted = self.up_to.is_none();
    }

    pub async fn collect(mut self) -> ChatResult<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(page) = self.next_page().await? {
            messages.extend(page);
        }
        Ok(messages)
    }

    pub fn into_stream(self) -> impl Stream<Item = ChatResult<Message>> {
        stream::try_unfold(self, |mut history| async move {
            Ok::<_, ChatError>(history.next_page().await?.map(|page| (page, history)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Message, ChatError>)))
        .try_flatten()
    }
}
