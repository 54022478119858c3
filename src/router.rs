//! Persist-then-push fan-out of new messages.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    chat::SessionContext,
    model::{Conversation, Draft, Message},
    protocol::{MessagePayload, ServerEvent},
    sessions::{Push, SessionRegistry},
    store::MessageStore,
    ChatResult,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message: Message,
    /// Sessions the payload was queued to, the sender's own included.
    pub delivered: usize,
    /// Sessions that were closing or too far behind to take it.
    pub dropped: usize,
}

pub struct FanoutRouter {
    store: MessageStore,
    registry: Arc<SessionRegistry>,
    // conversation key -> lane serializing append+enqueue; present only
    // while some send holds or waits on it
    lanes: DashMap<String, Arc<Mutex<()>>>,
}

/// A claim on one conversation's lane. Dropping the last claim removes the
/// lane from the map, so idle or bogus conversations cost nothing.
struct Lane<'a> {
    lanes: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    lock: Option<Arc<Mutex<()>>>,
}

impl Lane<'_> {
    async fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        Some(self.lock.as_ref()?.lock().await)
    }
}

impl Drop for Lane<'_> {
    fn drop(&mut self) {
        self.lock = None;
        // claims are taken under the same shard lock, so a count of one
        // means nobody else holds or waits on this lane
        self.lanes.remove_if(&self.key, |_, lane| Arc::strong_count(lane) == 1);
    }
}

impl FanoutRouter {
    pub fn new(store: MessageStore, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry, lanes: DashMap::new() }
    }

    fn lane(&self, key: String) -> Lane<'_> {
        let lock = self.lanes.entry(key.clone()).or_default().clone();
        Lane { lanes: &self.lanes, key, lock: Some(lock) }
    }

    /// Conversations with a send in flight.
    pub fn lanes_in_use(&self) -> usize {
        self.lanes.len()
    }

    /// Store the message, then queue it to every live session of every
    /// participant. Nothing is pushed unless the append succeeded.
    pub async fn send(
        &self,
        ctx: &SessionContext,
        conversation: &Conversation,
        draft: Draft,
    ) -> ChatResult<DeliveryReceipt> {
        let key = conversation.key();
        let lane = self.lane(key.clone());
        // held until every session has the message queued, so queue order
        // per session follows append order
        let _turn = lane.lock().await;

        let (message, participants) = self.store.commit(conversation, ctx.user.id, draft).await?;

        let event = Arc::new(ServerEvent::NewMessage(MessagePayload::new(&message, &ctx.user.username)));
        let (mut delivered, mut dropped) = (0, 0);

        // the sender is a participant, so its other devices get the echo
        for recipient in participants {
            for session in self.registry.sessions_of(recipient) {
                match session.deliver(&key, message.id, event.clone()) {
                    Push::Queued => delivered += 1,
                    Push::Duplicate => {}
                    Push::Full => {
                        dropped += 1;
                        tracing::warn!(
                            session_id = %session.id(),
                            user_id = %recipient,
                            message_id = %message.id,
                            "session queue full, dropping push"
                        );
                    }
                    Push::Closed => {
                        dropped += 1;
                        tracing::debug!(session_id = %session.id(), "session gone, dropping push");
                    }
                }
            }
        }

        tracing::debug!(
            conversation = %conversation,
            message_id = %message.id,
            sender = %ctx.user.id,
            delivered,
            dropped,
            "message fanned out"
        );
        Ok(DeliveryReceipt { message, delivered, dropped })
    }
}
