//! Agent message routing for murmur.
//!
//! - [`conversation`]: per-conversation ordering and buffering
//! - [`delivery`]: retry policy, dedup, sequence tracking, in-flight table
//! - [`router`]: the [`MessageRouter`] itself
//! - [`fault`]: circuit breakers and supervisor trees

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(unsafe_code)]

pub mod conversation;
pub mod dead_letter;
pub mod delivery;
pub mod envelope;
pub mod fault;
pub mod remote;
pub mod router;

pub use conversation::{
    Arrival, ConversationManager, ConversationState, ConversationStats, ConversationStatus, Expiry,
};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use delivery::{
    DedupCache, DeliveryStatus, FailureReason, InFlightRecord, InFlightStatus, InFlightTable,
    RetryPolicy, SenderSequencer, SequenceTracker,
};
pub use envelope::{Content, Envelope, Performative, Priority};
pub use fault::{
    CircuitBreaker, CircuitBreakers, NodeId, NodeStatus, RestartReport, RestartStrategy,
    Supervised, SupervisorHandle, SupervisorTree,
};
pub use remote::{ForwardReply, InboundOutcome, RemoteTransport};
pub use router::{LocalAgent, MailboxAgent, MessageRouter, RouterConfig};
