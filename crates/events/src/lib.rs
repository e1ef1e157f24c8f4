//! Structured observability events for murmur.
//!
//! Every routing decision, circuit transition, partition transition,
//! supervisor restart or escalation, and membership change is published as an
//! [`ObservabilityEvent`] carrying a correlation id.
//!
//! # Example
//!
//! ```ignore
//! use murmur_events::{EventBus, EventPattern, ObservabilityEvent};
//! use murmur_core::PartitionState;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::in_memory();
//!     let mut sub = bus.subscribe_with_pattern(EventPattern::ByType(
//!         "partition_transition".into(),
//!     ));
//!
//!     bus.emit(ObservabilityEvent::partition(
//!         PartitionState::Majority,
//!         PartitionState::Minority,
//!         2,
//!         3,
//!     ))
//!     .await;
//!
//!     let event = sub.recv().await.unwrap();
//!     println!("Received: {}", event.event_type());
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(unsafe_code)]

pub mod bus;
pub mod error;
pub mod event;
pub mod store;

pub use bus::{EventBus, EventPattern, EventSubscription};
pub use error::{Error, Result};
pub use event::{EventId, EventKind, ObservabilityEvent, RouteDecision};
pub use store::{EventStore, InMemoryEventStore, TracingEventStore};
