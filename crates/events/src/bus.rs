//! Event bus for publishing observability events.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use murmur_core::CorrelationId;

use crate::error::{Error, Result};
use crate::event::{EventId, ObservabilityEvent};
use crate::store::{EventStore, InMemoryEventStore, TracingEventStore};

/// Pattern for filtering events.
#[derive(Debug, Clone)]
pub enum EventPattern {
    /// Match all events.
    All,
    /// Match events by type.
    ByType(String),
    /// Match events by any of several types.
    ByTypes(Vec<String>),
    /// Match events sharing a correlation id.
    ByCorrelation(CorrelationId),
}

impl EventPattern {
    /// Check if an event matches this pattern.
    #[must_use]
    pub fn matches(&self, event: &ObservabilityEvent) -> bool {
        match self {
            Self::All => true,
            Self::ByType(t) => event.event_type() == t,
            Self::ByTypes(types) => types.iter().any(|t| event.event_type() == t),
            Self::ByCorrelation(id) => &event.correlation_id == id,
        }
    }
}

/// Subscription handle for receiving events.
pub struct EventSubscription {
    receiver: broadcast::Receiver<ObservabilityEvent>,
    pattern: EventPattern,
}

impl EventSubscription {
    /// Receive the next matching event.
    ///
    /// # Errors
    ///
    /// `Error::Lagged` if events were dropped before this subscriber read
    /// them; `Error::ChannelClosed` once the bus is gone.
    pub async fn recv(&mut self) -> Result<ObservabilityEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.pattern.matches(&event) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(Error::Lagged { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    }

    /// Take the next matching event if one is already queued.
    ///
    /// # Errors
    ///
    /// `Error::ChannelClosed` if nothing matching is queued or the bus is gone.
    pub fn try_recv(&mut self) -> Result<ObservabilityEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.pattern.matches(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return Err(Error::ChannelClosed),
            }
        }
    }
}

/// Event bus: stores events and fans them out to subscribers.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn EventStore>,
    broadcast: broadcast::Sender<ObservabilityEvent>,
}

impl EventBus {
    /// Broadcast channel capacity used by [`EventBus::new`].
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    /// Create a new event bus with the given store.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self::with_channel_capacity(store, Self::DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit broadcast capacity.
    #[must_use]
    pub fn with_channel_capacity(store: Arc<dyn EventStore>, capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self { store, broadcast }
    }

    /// Bus over a bounded in-memory store that logs every event.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(TracingEventStore::new(InMemoryEventStore::new())))
    }

    /// Publish an event.
    ///
    /// The event is stored and broadcast to all subscribers.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the event is not broadcast in that case.
    pub async fn publish(&self, event: ObservabilityEvent) -> Result<EventId> {
        let event_id = self.store.append(event.clone()).await?;

        debug!(
            event_id = %event_id,
            event_type = event.event_type(),
            correlation_id = %event.correlation_id,
            "publishing event"
        );

        // No receivers is not an error.
        let _ = self.broadcast.send(event);
        Ok(event_id)
    }

    /// Publish without failing the caller; store errors are logged.
    pub async fn emit(&self, event: ObservabilityEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.publish(event).await {
            tracing::warn!(event_type, error = %e, "dropping observability event");
        }
    }

    /// Subscribe to all events.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_with_pattern(EventPattern::All)
    }

    /// Subscribe to events matching a pattern.
    #[must_use]
    pub fn subscribe_with_pattern(&self, pattern: EventPattern) -> EventSubscription {
        EventSubscription {
            receiver: self.broadcast.subscribe(),
            pattern,
        }
    }

    /// Replay retained events after a given event ID.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn replay_from(&self, from: Option<EventId>) -> Result<Vec<ObservabilityEvent>> {
        self.store.read(from).await
    }

    /// Get the underlying event store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }
}
