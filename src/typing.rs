//! Typing indicators: relayed as-is, never stored.
//!
//! Each (conversation, user) pair is either idle or typing. An active signal
//! starts or refreshes an idle timer; when it fires without a refresh the
//! other participants get a `user_stop_typing`, same as an explicit stop.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;

use crate::{
    chat::SessionContext,
    model::{Conversation, ConversationRef, UserId},
    protocol::{conversation_ref_for, ServerEvent},
    sessions::{Push, SessionRegistry},
    store::MessageStore,
    ChatResult,
};

#[derive(Clone)]
pub struct TypingCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: MessageStore,
    registry: Arc<SessionRegistry>,
    idle_timeout: Option<Duration>,
    // (conversation key, user) -> generation of the latest active signal
    typing: DashMap<(String, UserId), u64>,
    // never reused, so a timer from an earlier burst can't match a later one
    generations: AtomicU64,
}

impl TypingCoordinator {
    pub fn new(store: MessageStore, registry: Arc<SessionRegistry>, idle_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                idle_timeout,
                typing: DashMap::new(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_typing(&self, conversation: &Conversation, user_id: UserId) -> bool {
        self.inner.typing.contains_key(&(conversation.key(), user_id))
    }

    pub async fn set_typing(&self, ctx: &SessionContext, conversation: &Conversation, active: bool) -> ChatResult<()> {
        let participants = self.inner.store.authorize(conversation, ctx.user.id).await?;
        let slot = (conversation.key(), ctx.user.id);
        let user_id = ctx.user.id;

        if active {
            let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
            self.inner.typing.insert(slot.clone(), generation);
            if let Some(timeout) = self.inner.idle_timeout {
                self.arm_idle_timer(user_id, *conversation, participants.clone(), slot, generation, timeout);
            }

            let username = ctx.user.username.clone();
            self.inner.relay(user_id, conversation, &participants, |conversation| ServerEvent::UserTyping {
                user_id,
                username: username.clone(),
                conversation,
            });
        } else {
            self.inner.typing.remove(&slot);
            self.inner.relay_stop(user_id, conversation, &participants);
        }
        Ok(())
    }

    /// Drop every indicator `user_id` still has up and tell the other
    /// participants. Runs once the user's last session is gone. Returns how
    /// many were cleared.
    pub async fn clear_user(&self, user_id: UserId) -> usize {
        let stale: Vec<(String, u64)> = self
            .inner
            .typing
            .iter()
            .filter(|entry| entry.key().1 == user_id)
            .map(|entry| (entry.key().0.clone(), *entry.value()))
            .collect();

        let mut cleared = 0;
        for (key, generation) in stale {
            let slot = (key, user_id);
            // a signal from a session that came back since keeps its state
            if self.inner.typing.remove_if(&slot, |_, current| *current == generation).is_none() {
                continue;
            }
            cleared += 1;

            let participants = match Conversation::parse_key(&slot.0) {
                Ok(conversation) => self.inner.store.participants(&conversation).await.map(|p| (conversation, p)),
                Err(err) => Err(err),
            };
            match participants {
                Ok((conversation, participants)) => self.inner.relay_stop(user_id, &conversation, &participants),
                Err(err) => {
                    tracing::warn!(user_id = %user_id, conversation = %slot.0, error = %err, "could not relay typing stop");
                }
            }
        }

        if cleared > 0 {
            tracing::debug!(user_id = %user_id, cleared, "typing cleared on disconnect");
        }
        cleared
    }

    fn arm_idle_timer(
        &self,
        user_id: UserId,
        conversation: Conversation,
        participants: Vec<UserId>,
        slot: (String, UserId),
        generation: u64,
        timeout: Duration,
    ) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // a refresh or an explicit stop since then means this timer is stale
            if inner.typing.remove_if(&slot, |_, current| *current == generation).is_some() {
                tracing::debug!(user_id = %user_id, conversation = %conversation, "typing went idle");
                inner.relay_stop(user_id, &conversation, &participants);
            }
        });
    }
}

impl Inner {
    fn relay_stop(&self, user_id: UserId, conversation: &Conversation, participants: &[UserId]) {
        self.relay(user_id, conversation, participants, |conversation| ServerEvent::UserStopTyping {
            user_id,
            conversation,
        });
    }

    fn relay(
        &self,
        user_id: UserId,
        conversation: &Conversation,
        participants: &[UserId],
        event: impl Fn(ConversationRef) -> ServerEvent,
    ) {
        for &recipient in participants.iter().filter(|&&p| p != user_id) {
            let event = Arc::new(event(conversation_ref_for(conversation, recipient)));

            for session in self.registry.sessions_of(recipient) {
                if session.push(event.clone()) != Push::Queued {
                    tracing::debug!(session_id = %session.id(), "typing signal dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use time::OffsetDateTime;
    use tokio::{
        sync::mpsc,
        time::{advance, Instant},
    };

    use crate::{
        model::{Group, GroupId, Message, MessageId, User},
        sessions::Outbound,
        store::{Directory, MessageLog, NewMessage},
        ChatError,
    };

    const IDLE: Duration = Duration::from_millis(50);

    /// Two users, no groups, nothing that actually waits on I/O, so the
    /// paused clock only moves when the tests say so.
    struct Pair;

    fn alice() -> User {
        User { id: UserId(1), username: "alice".into(), last_seen: None }
    }

    #[async_trait]
    impl Directory for Pair {
        async fn find_user(&self, user_id: UserId) -> ChatResult<Option<User>> {
            Ok(match user_id.0 {
                1 => Some(alice()),
                2 => Some(User { id: user_id, username: "bob".into(), last_seen: None }),
                _ => None,
            })
        }

        async fn group_members(&self, _: GroupId) -> ChatResult<Option<Vec<UserId>>> {
            Ok(None)
        }

        async fn touch_last_seen(&self, _: UserId, _: OffsetDateTime) -> ChatResult<()> {
            Ok(())
        }

        async fn list_users(&self) -> ChatResult<Vec<User>> {
            Ok(Vec::new())
        }

        async fn groups_of(&self, _: UserId) -> ChatResult<Vec<Group>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl MessageLog for Pair {
        async fn insert(&self, _: &NewMessage) -> ChatResult<MessageId> {
            Err(ChatError::invalid("read only"))
        }

        async fn query(&self, _: &Conversation, _: Option<MessageId>, _: MessageId, _: u32) -> ChatResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn latest_id(&self, _: &Conversation) -> ChatResult<Option<MessageId>> {
            Ok(None)
        }

        async fn update_read_flags(&self, _: &Conversation, _: OffsetDateTime, _: UserId) -> ChatResult<u64> {
            Ok(0)
        }
    }

    struct Setup {
        typing: TypingCoordinator,
        alice: SessionContext,
        bob_rx: mpsc::Receiver<Outbound>,
        conversation: Conversation,
    }

    fn setup(idle_timeout: Option<Duration>) -> Setup {
        let pair = Arc::new(Pair);
        let store = MessageStore::new(pair.clone(), pair);
        let (transitions, _) = mpsc::unbounded_channel();
        let registry = Arc::new(SessionRegistry::new(8, transitions));

        let (alice_tx, _alice_rx) = mpsc::channel(16);
        let (bob_tx, bob_rx) = mpsc::channel(16);
        let session_id = registry.register(UserId(1), alice_tx).unwrap();
        registry.register(UserId(2), bob_tx).unwrap();

        Setup {
            typing: TypingCoordinator::new(store, registry, idle_timeout),
            alice: SessionContext { session_id, user: alice() },
            bob_rx,
            conversation: Conversation::direct(UserId(1), UserId(2)).unwrap(),
        }
    }

    /// Let woken timer tasks run.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn is_stop(outbound: &Outbound) -> bool {
        matches!(outbound, Outbound::Event(event) if matches!(**event, ServerEvent::UserStopTyping { .. }))
    }

    fn is_start(outbound: &Outbound) -> bool {
        matches!(outbound, Outbound::Event(event) if matches!(**event, ServerEvent::UserTyping { .. }))
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_restarts_the_idle_timer() {
        let Setup { typing, alice, mut bob_rx, conversation } = setup(Some(IDLE));
        let start = Instant::now();

        typing.set_typing(&alice, &conversation, true).await.unwrap();
        advance(Duration::from_millis(30)).await;
        typing.set_typing(&alice, &conversation, true).await.unwrap();
        advance(Duration::from_millis(30)).await;
        settle().await;

        // past the first timer's deadline, still typing
        assert!(typing.is_typing(&conversation, UserId(1)));
        assert!(is_start(&bob_rx.try_recv().unwrap()));
        assert!(is_start(&bob_rx.try_recv().unwrap()));
        assert!(bob_rx.try_recv().is_err());

        let stop = bob_rx.recv().await.unwrap();
        assert!(is_stop(&stop));
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert!(!typing.is_typing(&conversation, UserId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_from_an_earlier_burst_leaves_a_new_one_alone() {
        let Setup { typing, alice, mut bob_rx, conversation } = setup(Some(IDLE));
        let start = Instant::now();

        typing.set_typing(&alice, &conversation, true).await.unwrap();
        advance(Duration::from_millis(20)).await;
        typing.set_typing(&alice, &conversation, false).await.unwrap();
        advance(Duration::from_millis(10)).await;
        typing.set_typing(&alice, &conversation, true).await.unwrap();

        // the first burst's timer fires at 50ms
        advance(Duration::from_millis(25)).await;
        settle().await;
        assert!(typing.is_typing(&conversation, UserId(1)));

        let seen: Vec<Outbound> = std::iter::from_fn(|| bob_rx.try_recv().ok()).collect();
        assert_eq!(seen.len(), 3);
        assert!(is_start(&seen[0]) && is_stop(&seen[1]) && is_start(&seen[2]));

        assert!(is_stop(&bob_rx.recv().await.unwrap()));
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert!(!typing.is_typing(&conversation, UserId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn without_a_timeout_typing_lasts_until_stopped() {
        let Setup { typing, alice, mut bob_rx, conversation } = setup(None);

        typing.set_typing(&alice, &conversation, true).await.unwrap();
        advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(typing.is_typing(&conversation, UserId(1)));
        assert!(is_start(&bob_rx.try_recv().unwrap()));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_a_user_stops_their_indicators_once() {
        let Setup { typing, alice, mut bob_rx, conversation } = setup(None);

        typing.set_typing(&alice, &conversation, true).await.unwrap();
        assert!(is_start(&bob_rx.try_recv().unwrap()));

        assert_eq!(typing.clear_user(UserId(1)).await, 1);
        assert!(is_stop(&bob_rx.try_recv().unwrap()));
        assert!(!typing.is_typing(&conversation, UserId(1)));

        assert_eq!(typing.clear_user(UserId(1)).await, 0);
        assert!(bob_rx.try_recv().is_err());
    }
}
