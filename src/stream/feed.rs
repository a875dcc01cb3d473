//! Caller-side notification history.
//!
//! The stream client never stores events. `NotificationFeed` is the buffer a
//! UI layer keeps instead: newest first, unbounded unless the caller picks a
//! capacity. `NotificationSubscription` pairs one client with one feed for the
//! lifetime of a view.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::StreamConfig;
use crate::stream::client::{NotificationClient, StreamClientError};
use crate::stream::lifecycle::{ConnectionState, NotificationHandler};
use crate::stream::proto::NotificationEvent;

/// Shared, newest-first buffer of received notifications.
///
/// Clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct NotificationFeed {
    events: Arc<RwLock<VecDeque<NotificationEvent>>>,
    capacity: Option<usize>,
}

impl NotificationFeed {
    /// Creates an unbounded feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a feed that keeps at most `capacity` events, evicting the
    /// oldest first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity: Some(capacity),
        }
    }

    /// Inserts an event at the front of the feed.
    pub fn push(&self, event: NotificationEvent) {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.push_front(event);
        if let Some(capacity) = self.capacity {
            events.truncate(capacity);
        }
    }

    /// Returns all events, newest first.
    pub fn snapshot(&self) -> Vec<NotificationEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.iter().cloned().collect()
    }

    /// Returns the most recent event.
    pub fn latest(&self) -> Option<NotificationEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl NotificationHandler for NotificationFeed {
    fn on_notification(&mut self, event: NotificationEvent) {
        self.push(event);
    }
}

/// One stream client feeding one [`NotificationFeed`].
///
/// Closing or dropping the subscription closes the client; the feed stays
/// readable afterwards.
#[derive(Debug)]
pub struct NotificationSubscription {
    client: NotificationClient,
    feed: NotificationFeed,
}

impl NotificationSubscription {
    /// Opens a subscription backed by an unbounded feed.
    pub fn open(config: StreamConfig) -> Result<Self, StreamClientError> {
        Self::open_with_feed(config, NotificationFeed::new())
    }

    /// Opens a subscription that appends into an existing feed.
    pub fn open_with_feed(
        config: StreamConfig,
        feed: NotificationFeed,
    ) -> Result<Self, StreamClientError> {
        let client = NotificationClient::connect(config, feed.clone())?;
        Ok(Self { client, feed })
    }

    /// Received events, newest first.
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.feed.snapshot()
    }

    pub fn feed(&self) -> &NotificationFeed {
        &self.feed
    }

    pub fn client(&self) -> &NotificationClient {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Closes the underlying client. Idempotent.
    pub fn close(&self) {
        self.client.close();
    }
}
