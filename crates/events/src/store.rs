//! Event store trait and implementations.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use murmur_core::CorrelationId;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::event::{EventId, ObservabilityEvent};

/// Trait for event storage backends.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event to the store.
    async fn append(&self, event: ObservabilityEvent) -> Result<EventId>;

    /// Read events after a given event ID, or all retained events.
    async fn read(&self, from: Option<EventId>) -> Result<Vec<ObservabilityEvent>>;

    /// Read events sharing a correlation id.
    async fn read_correlated(&self, correlation_id: &CorrelationId)
    -> Result<Vec<ObservabilityEvent>>;

    /// Get the last event ID.
    async fn last_event_id(&self) -> Result<Option<EventId>>;

    /// Get the number of retained events.
    async fn count(&self) -> Result<usize>;
}

/// Bounded in-memory event store. The oldest events are dropped first.
pub struct InMemoryEventStore {
    events: RwLock<VecDeque<ObservabilityEvent>>,
    capacity: usize,
}

impl InMemoryEventStore {
    /// Default number of retained events.
    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// Create a new in-memory event store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a store retaining at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create a new in-memory event store wrapped in an Arc.
    #[must_use]
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: ObservabilityEvent) -> Result<EventId> {
        let event_id = event.event_id;
        let mut events = self.events.write().await;
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(event_id)
    }

    async fn read(&self, from: Option<EventId>) -> Result<Vec<ObservabilityEvent>> {
        let events = self.events.read().await;
        let start = from
            .and_then(|id| events.iter().position(|e| e.event_id == id))
            .map_or(0, |pos| pos + 1);
        Ok(events.iter().skip(start).cloned().collect())
    }

    async fn read_correlated(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<ObservabilityEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| &e.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    async fn last_event_id(&self) -> Result<Option<EventId>> {
        let events = self.events.read().await;
        Ok(events.back().map(|e| e.event_id))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.events.read().await.len())
    }
}

/// A wrapper that logs every event through `tracing` before storing it.
pub struct TracingEventStore<S: EventStore> {
    inner: S,
}

impl<S: EventStore> TracingEventStore<S> {
    /// Create a new tracing event store.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: EventStore> EventStore for TracingEventStore<S> {
    async fn append(&self, event: ObservabilityEvent) -> Result<EventId> {
        match serde_json::to_string(&event.kind) {
            Ok(detail) => tracing::info!(
                event_type = event.event_type(),
                correlation_id = %event.correlation_id,
                detail = %detail,
                "observability event"
            ),
            Err(e) => tracing::warn!(
                event_type = event.event_type(),
                error = %e,
                "failed to render observability event"
            ),
        }
        let result = self.inner.append(event).await;
        if let Ok(ref id) = result {
            tracing::trace!(event_id = %id, "event appended");
        }
        result
    }

    async fn read(&self, from: Option<EventId>) -> Result<Vec<ObservabilityEvent>> {
        tracing::debug!(from = ?from, "reading events");
        self.inner.read(from).await
    }

    async fn read_correlated(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<ObservabilityEvent>> {
        tracing::debug!(correlation_id = %correlation_id, "reading correlated events");
        self.inner.read_correlated(correlation_id).await
    }

    async fn last_event_id(&self) -> Result<Option<EventId>> {
        self.inner.last_event_id().await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}
