//! # Broadcast Event Dispatcher
//!
//! Publishes [`SyncNotification`]s on a `tokio::sync::broadcast` channel.

use crate::ports::{EventDispatcher, SyncNotification};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory implementation of [`EventDispatcher`].
///
/// Every subscriber sees every notification published after it subscribed.
/// Publishing with no subscribers is not an error.
pub struct BroadcastEventDispatcher {
    sender: broadcast::Sender<SyncNotification>,
    published: AtomicU64,
}

impl BroadcastEventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for BroadcastEventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher for BroadcastEventDispatcher {
    fn dispatch(&self, notification: SyncNotification) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let receivers = self.sender.send(notification.clone()).unwrap_or(0);
        trace!(?notification, receivers, "Sync notification published");
    }
}
