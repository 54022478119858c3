use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use time::OffsetDateTime;

use crate::{
    model::{
        from_unix_millis, to_unix_millis, Conversation, Group, GroupId, MediaKind, Message, MessageId,
        User, UserId,
    },
    store::{Directory, MessageLog, NewMessage},
    ChatError, ChatResult,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        last_seen INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS chat_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        creator_id INTEGER NOT NULL REFERENCES users(id)
    )",
    "CREATE TABLE IF NOT EXISTS group_members (
        group_id INTEGER NOT NULL REFERENCES chat_groups(id),
        user_id INTEGER NOT NULL REFERENCES users(id),
        PRIMARY KEY (group_id, user_id)
    )",
    // AUTOINCREMENT: ids are never reused, so they keep increasing
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation TEXT NOT NULL,
        sender_id INTEGER NOT NULL REFERENCES users(id),
        content TEXT NOT NULL,
        media_type TEXT NOT NULL,
        media_url TEXT,
        created_at INTEGER NOT NULL,
        read INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS messages_by_conversation ON messages (conversation, id)",
];

type MessageRow = (i64, String, i64, String, String, Option<String>, i64, bool);

/// SQLite-backed message log and directory.
#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> ChatResult<Self> {
        let db_pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self::new(db_pool);
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database. One connection, kept forever, so every
    /// query sees the same data.
    pub async fn in_memory() -> ChatResult<Self> {
        let db_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(db_pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    pub async fn migrate(&self) -> ChatResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db_pool).await?;
        }
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> ChatResult<User> {
        let id = sqlx::query("INSERT INTO users (username) VALUES (?)")
            .bind(username)
            .execute(&self.db_pool)
            .await?
            .last_insert_rowid();

        tracing::info!(user_id = id, username, "user created");
        Ok(User { id: UserId(id), username: username.to_owned(), last_seen: None })
    }

    /// Create a group. The creator is always a member.
    pub async fn create_group(&self, name: &str, creator: UserId, members: &[UserId]) -> ChatResult<GroupId> {
        let mut tx = self.db_pool.begin().await?;

        let id = sqlx::query("INSERT INTO chat_groups (name,creator_id) VALUES (?,?)")
            .bind(name)
            .bind(creator.0)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for member in std::iter::once(&creator).chain(members) {
            sqlx::query("INSERT OR IGNORE INTO group_members (group_id,user_id) VALUES (?,?)")
                .bind(id)
                .bind(member.0)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(GroupId(id))
    }
}

fn message_from_row(
    (id, conversation, sender_id, content, media_type, media_url, created_at, read): MessageRow,
) -> ChatResult<Message> {
    Ok(Message {
        id: MessageId(id),
        conversation: Conversation::parse_key(&conversation)?,
        sender_id: UserId(sender_id),
        content,
        media_type: MediaKind::from_str(&media_type)
            .map_err(|err| ChatError::StorageUnavailable(err.to_string()))?,
        media_url,
        timestamp: from_unix_millis(created_at)?,
        read,
    })
}

#[async_trait]
impl MessageLog for SqliteStore {
    async fn insert(&self, message: &NewMessage) -> ChatResult<MessageId> {
        let id = sqlx::query(
            "INSERT INTO messages (conversation,sender_id,content,media_type,media_url,created_at) values (?,?,?,?,?,?)",
        )
        .bind(message.conversation.key())
        .bind(message.sender_id.0)
        .bind(&message.draft.content)
        .bind(message.draft.media_kind.as_str())
        .bind(message.draft.media_url.as_deref())
        .bind(to_unix_millis(message.timestamp))
        .execute(&self.db_pool)
        .await?
        .last_insert_rowid();

        Ok(MessageId(id))
    }

    async fn query(
        &self,
        conversation: &Conversation,
        after: Option<MessageId>,
        up_to: MessageId,
        limit: u32,
    ) -> ChatResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,conversation,sender_id,content,media_type,media_url,created_at,read FROM messages
             WHERE conversation=? AND id>? AND id<=? ORDER BY id ASC LIMIT ?",
        )
        .bind(conversation.key())
        .bind(after.map_or(i64::MIN, |id| id.0))
        .bind(up_to.0)
        .bind(i64::from(limit))
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn latest_id(&self, conversation: &Conversation) -> ChatResult<Option<MessageId>> {
        let (latest,): (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM messages WHERE conversation=?")
            .bind(conversation.key())
            .fetch_one(&self.db_pool)
            .await?;

        Ok(latest.map(MessageId))
    }

    async fn update_read_flags(
        &self,
        conversation: &Conversation,
        before: OffsetDateTime,
        exclude_sender: UserId,
    ) -> ChatResult<u64> {
        let updated = sqlx::query(
            "UPDATE messages SET read=1 WHERE conversation=? AND sender_id!=? AND read=0 AND created_at<=?",
        )
        .bind(conversation.key())
        .bind(exclude_sender.0)
        .bind(to_unix_millis(before))
        .execute(&self.db_pool)
        .await?
        .rows_affected();

        Ok(updated)
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn find_user(&self, user_id: UserId) -> ChatResult<Option<User>> {
        let row: Option<(i64, String, Option<i64>)> =
            sqlx::query_as("SELECT id,username,last_seen FROM users WHERE id=?")
                .bind(user_id.0)
                .fetch_optional(&self.db_pool)
                .await?;

        let Some((id, username, last_seen)) = row else {
            return Ok(None);
        };
        Ok(Some(User {
            id: UserId(id),
            username,
            last_seen: last_seen.map(from_unix_millis).transpose()?,
        }))
    }

    async fn group_members(&self, group_id: GroupId) -> ChatResult<Option<Vec<UserId>>> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM chat_groups WHERE id=?")
            .bind(group_id.0)
            .fetch_optional(&self.db_pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let members: Vec<(i64,)> = sqlx::query_as("SELECT user_id FROM group_members WHERE group_id=? ORDER BY user_id")
            .bind(group_id.0)
            .fetch_all(&self.db_pool)
            .await?;

        Ok(Some(members.into_iter().map(|(id,)| UserId(id)).collect()))
    }

    async fn touch_last_seen(&self, user_id: UserId, at: OffsetDateTime) -> ChatResult<()> {
        let updated = sqlx::query("UPDATE users SET last_seen=? WHERE id=?")
            .bind(to_unix_millis(at))
            .bind(user_id.0)
            .execute(&self.db_pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(ChatError::not_found("user", user_id));
        }
        Ok(())
    }

    async fn list_users(&self) -> ChatResult<Vec<User>> {
        let rows: Vec<(i64, String, Option<i64>)> = sqlx::query_as("SELECT id,username,last_seen FROM users ORDER BY id")
            .fetch_all(&self.db_pool)
            .await?;

        rows.into_iter()
            .map(|(id, username, last_seen)| {
                Ok(User {
                    id: UserId(id),
                    username,
                    last_seen: last_seen.map(from_unix_millis).transpose()?,
                })
            })
            .collect()
    }

    async fn groups_of(&self, user_id: UserId) -> ChatResult<Vec<Group>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT g.id,g.name FROM chat_groups g JOIN group_members m ON m.group_id=g.id
             WHERE m.user_id=? ORDER BY g.id",
        )
        .bind(user_id.0)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows.into_iter().map(|(id, name)| Group { id: GroupId(id), name }).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{now_millis, Draft};

    #[tokio::test]
    async fn messages_page_by_id_within_one_conversation() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create_user("a").await.unwrap();
        let b = store.create_user("b").await.unwrap();
        let c = store.create_user("c").await.unwrap();
        let ab = Conversation::direct(a.id, b.id).unwrap();
        let ac = Conversation::direct(a.id, c.id).unwrap();

        let mut ids = Vec::new();
        for (conversation, text) in [(ab, "1"), (ac, "x"), (ab, "2"), (ab, "3")] {
            let id = store
                .insert(&NewMessage {
                    conversation,
                    sender_id: a.id,
                    draft: Draft::text(text),
                    timestamp: now_millis(),
                })
                .await
                .unwrap();
            ids.push(id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let latest = store.latest_id(&ab).await.unwrap().unwrap();
        assert_eq!(latest, ids[3]);

        let first = store.query(&ab, None, latest, 2).await.unwrap();
        let contents: Vec<_> = first.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["1", "2"]);

        let rest = store.query(&ab, Some(first[1].id), latest, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].content, "3");
        assert_eq!(rest[0].conversation, ab);
    }

    #[tokio::test]
    async fn groups_always_contain_their_creator() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create_user("a").await.unwrap();
        let b = store.create_user("b").await.unwrap();

        let group = store.create_group("pals", a.id, &[b.id, b.id]).await.unwrap();
        assert_eq!(store.group_members(group).await.unwrap(), Some(vec![a.id, b.id]));
        assert_eq!(store.group_members(GroupId(999)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_seen_is_persisted() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create_user("a").await.unwrap();
        let at = now_millis();

        store.touch_last_seen(a.id, at).await.unwrap();
        assert_eq!(store.find_user(a.id).await.unwrap().unwrap().last_seen, Some(at));
        assert!(store.touch_last_seen(UserId(404), at).await.is_err());
    }

    #[tokio::test]
    async fn directory_lists_users_and_memberships() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create_user("a").await.unwrap();
        let b = store.create_user("b").await.unwrap();
        let c = store.create_user("c").await.unwrap();
        let at = now_millis();
        store.touch_last_seen(b.id, at).await.unwrap();

        let ab = store.create_group("ab", a.id, &[b.id]).await.unwrap();
        store.create_group("c alone", c.id, &[]).await.unwrap();
        let ba = store.create_group("ba", b.id, &[a.id]).await.unwrap();

        let users = store.list_users().await.unwrap();
        let names: Vec<_> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(users[1].last_seen, Some(at));
        assert_eq!(users[0].last_seen, None);

        let groups = store.groups_of(a.id).await.unwrap();
        assert_eq!(groups, vec![Group { id: ab, name: "ab".into() }, Group { id: ba, name: "ba".into() }]);
        assert!(store.groups_of(UserId(404)).await.unwrap().is_empty());
    }
}
