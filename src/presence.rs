//! Online/offline state derived from the session registry.
//!
//! Transitions arrive in order on an unbounded channel fed by the registry;
//! this tracker records last-seen on the way down and rebroadcasts every
//! transition to all subscribers. Best effort: nothing is retried.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::{
    model::{now_millis, UserId},
    store::Directory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceTransition {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChanged {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Clone)]
pub struct PresenceTracker {
    tx: broadcast::Sender<PresenceChanged>,
    directory: Arc<dyn Directory>,
}

impl PresenceTracker {
    pub fn new(directory: Arc<dyn Directory>, capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
            directory,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChanged> {
        self.tx.subscribe()
    }

    /// Drain registry transitions until the registry goes away.
    pub fn spawn(&self, mut transitions: mpsc::UnboundedReceiver<PresenceTransition>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            while let Some(transition) = transitions.recv().await {
                tracker.apply(transition).await;
            }
            tracing::debug!("presence tracker stopped");
        });
    }

    pub async fn apply(&self, PresenceTransition { user_id, online }: PresenceTransition) {
        if !online {
            if let Err(err) = self.directory.touch_last_seen(user_id, now_millis()).await {
                tracing::warn!(user_id = %user_id, error = %err, "failed to record last seen");
            }
        }

        tracing::info!(user_id = %user_id, online, "presence changed");
        // no receivers is fine
        let _ = self.tx.send(PresenceChanged { user_id, online });
    }
}
