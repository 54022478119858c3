use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{ChatError, ChatResult};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

id_type!(UserId(i64));
id_type!(GroupId(i64));
id_type!(
    /// Assigned by the message log; strictly increasing across the store.
    MessageId(i64)
);
id_type!(SessionId(Uuid));

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

/// The unit of message ordering.
///
/// Direct pairs are canonical: `low < high`, so the same two users always map
/// to the same conversation regardless of who sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conversation {
    Direct { low: UserId, high: UserId },
    Group { group_id: GroupId },
}

impl Conversation {
    pub fn direct(a: UserId, b: UserId) -> ChatResult<Self> {
        if a == b {
            return Err(ChatError::invalid(format!("direct conversation of {a} with themselves")));
        }
        Ok(Self::Direct { low: a.min(b), high: a.max(b) })
    }

    pub fn group(group_id: GroupId) -> Self {
        Self::Group { group_id }
    }

    /// Storage key, also used to index per-conversation state in memory.
    pub fn key(&self) -> String {
        match self {
            Self::Direct { low, high } => format!("d:{low}:{high}"),
            Self::Group { group_id } => format!("g:{group_id}"),
        }
    }

    /// The other side of a direct conversation, as seen by `user`.
    pub fn peer_of(&self, user: UserId) -> Option<UserId> {
        match *self {
            Self::Direct { low, high } if low == user => Some(high),
            Self::Direct { low, high } if high == user => Some(low),
            _ => None,
        }
    }

    pub fn parse_key(key: &str) -> ChatResult<Self> {
        let corrupt = || ChatError::StorageUnavailable(format!("corrupt conversation key {key:?}"));
        let mut parts = key.split(':');
        let conversation = match (parts.next(), parts.next(), parts.next()) {
            (Some("d"), Some(low), Some(high)) => Self::direct(
                UserId(low.parse().map_err(|_| corrupt())?),
                UserId(high.parse().map_err(|_| corrupt())?),
            )?,
            (Some("g"), Some(id), None) => Self::group(GroupId(id.parse().map_err(|_| corrupt())?)),
            _ => return Err(corrupt()),
        };
        Ok(conversation)
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// How a client names a conversation: relative to itself for direct chats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationRef {
    Direct { user_id: UserId },
    Group { group_id: GroupId },
}

impl ConversationRef {
    pub fn resolve(self, caller: UserId) -> ChatResult<Conversation> {
        match self {
            Self::Direct { user_id } => Conversation::direct(caller, user_id),
            Self::Group { group_id } => Ok(Conversation::group(group_id)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }
}

impl FromStr for MediaKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "file" => Ok(Self::File),
            other => Err(ChatError::invalid(format!("unknown media type {other:?}"))),
        }
    }
}

/// What a sender asks to post; the store turns it into a [`Message`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub content: String,
    pub media_kind: MediaKind,
    pub media_url: Option<String>,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation: Conversation,
    pub sender_id: UserId,
    pub content: String,
    pub media_type: MediaKind,
    pub media_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub read: bool,
}

/// Current UTC time truncated to milliseconds, the precision the log keeps.
pub fn now_millis() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.nanosecond() / 1_000_000 * 1_000_000)
        .unwrap_or(now)
}

pub fn to_unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_millis(millis: i64) -> ChatResult<OffsetDateTime> {
    Ok(OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)?)
}
