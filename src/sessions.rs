//! Live connections per user.
//!
//! The registry is the only source of truth for "is this user online". A user
//! may hold any number of sessions (devices, tabs); presence transitions are
//! emitted only when a user's set flips between empty and non-empty.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    model::{MessageId, SessionId, UserId},
    presence::PresenceTransition,
    protocol::ServerEvent,
    ChatError, ChatResult,
};

/// What the connection layer's writer task receives.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<ServerEvent>),
    Close { code: u16, reason: String },
}

/// Result of a single push attempt. Only `Queued` means the session will see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    Duplicate,
    Full,
    Closed,
}

#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    user_id: UserId,
    created_at: OffsetDateTime,
    tx: mpsc::Sender<Outbound>,
    open: AtomicBool,
    // conversation key -> highest message id queued to this session
    delivered: DashMap<String, MessageId>,
}

impl SessionHandle {
    fn new(user_id: UserId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: SessionId::new(),
            user_id,
            created_at: OffsetDateTime::now_utc(),
            tx,
            open: AtomicBool::new(true),
            delivered: DashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue a control event. Never waits.
    pub fn push(&self, event: Arc<ServerEvent>) -> Push {
        if !self.is_open() {
            return Push::Closed;
        }
        self.try_send(Outbound::Event(event))
    }

    /// Queue a message event, refusing anything at or below what this session
    /// already got for the same conversation.
    pub fn deliver(&self, conversation_key: &str, id: MessageId, event: Arc<ServerEvent>) -> Push {
        if !self.is_open() {
            return Push::Closed;
        }

        let mut mark = self
            .delivered
            .entry(conversation_key.to_owned())
            .or_insert(MessageId(i64::MIN));
        if id <= *mark {
            return Push::Duplicate;
        }

        let outcome = self.try_send(Outbound::Event(event));
        if outcome == Push::Queued {
            *mark = id;
        }
        outcome
    }

    fn try_send(&self, outbound: Outbound) -> Push {
        match self.tx.try_send(outbound) {
            Ok(()) => Push::Queued,
            Err(TrySendError::Full(_)) => Push::Full,
            Err(TrySendError::Closed(_)) => Push::Closed,
        }
    }

    /// Ask the writer to close the socket, then stop accepting pushes.
    pub(crate) fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.try_send(Outbound::Close { code, reason: reason.to_owned() });
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

pub struct SessionRegistry {
    by_user: DashMap<UserId, HashMap<SessionId, Arc<SessionHandle>>>,
    owners: DashMap<SessionId, UserId>,
    live: AtomicUsize,
    capacity: usize,
    transitions: mpsc::UnboundedSender<PresenceTransition>,
}

impl SessionRegistry {
    pub fn new(capacity: usize, transitions: mpsc::UnboundedSender<PresenceTransition>) -> Self {
        Self {
            by_user: DashMap::new(),
            owners: DashMap::new(),
            live: AtomicUsize::new(0),
            capacity,
            transitions,
        }
    }

    pub fn register(&self, user_id: UserId, tx: mpsc::Sender<Outbound>) -> ChatResult<SessionId> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            })
            .map_err(|_| ChatError::ResourceExhausted { capacity: self.capacity })?;

        let handle = Arc::new(SessionHandle::new(user_id, tx));
        let session_id = handle.id;

        // the entry guard serializes every mutation of this user's set
        let mut sessions = self.by_user.entry(user_id).or_default();
        let came_online = sessions.is_empty();
        sessions.insert(session_id, handle);
        self.owners.insert(session_id, user_id);
        if came_online {
            let _ = self.transitions.send(PresenceTransition { user_id, online: true });
        }
        let count = sessions.len();
        drop(sessions);

        tracing::debug!(user_id = %user_id, session_id = %session_id, sessions = count, "session registered");
        Ok(session_id)
    }

    /// Remove a session. Unknown or already removed ids are a no-op.
    pub fn unregister(&self, session_id: SessionId) -> Option<Arc<SessionHandle>> {
        let (_, user_id) = self.owners.remove(&session_id)?;

        let Entry::Occupied(mut entry) = self.by_user.entry(user_id) else {
            return None;
        };
        let handle = entry.get_mut().remove(&session_id);
        if let Some(handle) = &handle {
            handle.mark_closed();
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        if entry.get().is_empty() {
            entry.remove();
            let _ = self.transitions.send(PresenceTransition { user_id, online: false });
        }

        tracing::debug!(user_id = %user_id, session_id = %session_id, "session unregistered");
        handle
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<SessionHandle>> {
        let user_id = *self.owners.get(&session_id)?;
        self.by_user.get(&user_id)?.get(&session_id).cloned()
    }

    /// Snapshot of a user's live sessions; empty when offline.
    pub fn sessions_of(&self, user_id: UserId) -> Vec<Arc<SessionHandle>> {
        self.by_user
            .get(&user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.by_user.get(&user_id).is_some_and(|sessions| !sessions.is_empty())
    }

    /// Queue `event` to every live session. Returns how many took it.
    pub fn broadcast(&self, event: Arc<ServerEvent>) -> usize {
        let sessions: Vec<Arc<SessionHandle>> = self
            .by_user
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect();

        sessions
            .iter()
            .filter(|session| session.push(event.clone()) == Push::Queued)
            .count()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.by_user.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
