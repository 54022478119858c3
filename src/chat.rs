//! The fan-out core as one object: registry, presence, store, router and
//! typing wired together, plus the connect/disconnect lifecycle.

use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::{broadcast::error::RecvError, mpsc};

use crate::{
    config::Config,
    model::{Group, SessionId, User, UserId},
    presence::{PresenceChanged, PresenceTracker},
    protocol::ServerEvent,
    router::FanoutRouter,
    sessions::{Outbound, SessionRegistry},
    store::MessageStore,
    typing::TypingCoordinator,
    ChatError, ChatResult,
};

/// WebSocket close code sent to sessions removed by [`Chat::evict_user`].
pub const CLOSE_EVICTED: u16 = 4003;

/// Who is acting, passed explicitly to every core operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user: User,
}

/// Another user as seen from the caller: directory data plus live presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    #[serde(flatten)]
    pub user: User,
    pub online: bool,
}

/// Who the caller can talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overview {
    pub users: Vec<Contact>,
    pub groups: Vec<Group>,
}

pub struct Chat {
    registry: Arc<SessionRegistry>,
    presence: PresenceTracker,
    store: MessageStore,
    router: FanoutRouter,
    typing: TypingCoordinator,
}

impl Chat {
    /// Must be called from within a tokio runtime: presence runs on
    /// background tasks.
    pub fn new(store: MessageStore, config: &Config) -> Arc<Self> {
        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SessionRegistry::new(config.max_sessions, transitions_tx));

        let presence = PresenceTracker::new(store.directory().clone(), config.presence_buffer);
        presence.spawn(transitions_rx);

        let router = FanoutRouter::new(store.clone(), registry.clone());
        let typing = TypingCoordinator::new(store.clone(), registry.clone(), config.typing_idle_timeout());

        Arc::new_cyclic(|chat| {
            spawn_presence_fanout(&presence, chat.clone());
            Self { registry, presence, store, router, typing }
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn router(&self) -> &FanoutRouter {
        &self.router
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    /// Register a new live connection for an authenticated user. The session
    /// immediately gets a `user_status` for everyone currently online.
    pub async fn connect(&self, user_id: UserId, handle: mpsc::Sender<Outbound>) -> ChatResult<SessionContext> {
        let user = self
            .store
            .directory()
            .find_user(user_id)
            .await?
            .ok_or_else(|| ChatError::not_found("user", user_id))?;

        let session_id = self.registry.register(user_id, handle)?;
        let ctx = SessionContext { session_id, user };

        for online in self.registry.online_users() {
            self.reply(&ctx, ServerEvent::UserStatus { user_id: online, online: true });
        }

        tracing::info!(user_id = %user_id, session_id = %session_id, "session connected");
        Ok(ctx)
    }

    pub fn disconnect(&self, session_id: SessionId) {
        if let Some(session) = self.registry.unregister(session_id) {
            tracing::info!(user_id = %session.user_id(), session_id = %session_id, "session disconnected");
        }
    }

    /// Close and forget every session of `user_id`. Returns how many there were.
    pub fn evict_user(&self, user_id: UserId, reason: &str) -> usize {
        let sessions = self.registry.sessions_of(user_id);
        for session in &sessions {
            session.close(CLOSE_EVICTED, reason);
            self.registry.unregister(session.id());
        }

        tracing::info!(user_id = %user_id, sessions = sessions.len(), reason, "user evicted");
        sessions.len()
    }

    /// Every other user with their last-seen and online state, and the
    /// groups `user_id` belongs to.
    pub async fn overview(&self, user_id: UserId) -> ChatResult<Overview> {
        let directory = self.store.directory();
        let users = directory
            .list_users()
            .await?
            .into_iter()
            .filter(|user| user.id != user_id)
            .map(|user| Contact { online: self.registry.is_online(user.id), user })
            .collect();

        Ok(Overview { users, groups: directory.groups_of(user_id).await? })
    }

    /// Push an event to the session behind `ctx` only.
    pub fn reply(&self, ctx: &SessionContext, event: ServerEvent) {
        if let Some(session) = self.registry.get(ctx.session_id) {
            session.push(Arc::new(event));
        }
    }
}

/// Presence changes go to every live session. A user going offline also
/// drops whatever typing indicators they left up.
fn spawn_presence_fanout(presence: &PresenceTracker, chat: Weak<Chat>) {
    let mut changes = presence.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(PresenceChanged { user_id, online }) => {
                    let Some(chat) = chat.upgrade() else {
                        break;
                    };
                    chat.registry.broadcast(Arc::new(ServerEvent::UserStatus { user_id, online }));
                    if !online {
                        chat.typing.clear_user(user_id).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "presence fan-out lagging, updates skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
