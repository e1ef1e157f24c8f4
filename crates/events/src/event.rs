//! Observability event types.

use chrono::{DateTime, Utc};
use murmur_core::{
    AgentId, CircuitState, CorrelationId, DeliveryGuarantee, MemberStatus, MessageId,
    PartitionState, ProcessId,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique, time-ordered identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    /// Create a new random event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get the inner ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome recorded for one routing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RouteDecision {
    /// Handed to a local agent.
    DeliveredLocal,
    /// Acknowledged by a remote host.
    Forwarded { process: ProcessId },
    /// Parked by the conversation manager until the gap fills.
    Buffered,
    /// Already seen; acknowledged without processing.
    Duplicate,
    /// Held while the partition is degraded.
    Held,
    /// Attempt failed; another follows after a backoff.
    Retrying { attempt: u32, backoff_ms: u64 },
    /// Terminal failure.
    Failed { reason: String },
    /// Policy exhausted; moved to the dead-letter queue.
    DeadLettered { reason: String },
    /// Withdrawn by the caller.
    Cancelled,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The router decided something about a message.
    RoutingDecision {
        message_id: MessageId,
        destination: AgentId,
        guarantee: DeliveryGuarantee,
        #[serde(flatten)]
        decision: RouteDecision,
    },
    /// A destination circuit changed position.
    CircuitTransition {
        destination: ProcessId,
        from: CircuitState,
        to: CircuitState,
        consecutive_failures: u32,
    },
    /// The local partition classification changed.
    PartitionTransition {
        from: PartitionState,
        to: PartitionState,
        alive: usize,
        quorum: usize,
    },
    /// A supervisor restarted one or more entities.
    SupervisorRestart {
        supervisor: String,
        failed: String,
        strategy: String,
        restarted: Vec<String>,
    },
    /// A supervisor gave up and handed the failure upwards.
    SupervisorEscalation {
        supervisor: String,
        failed: String,
        parent: Option<String>,
    },
    /// The local view of a peer changed.
    MembershipChange {
        process: ProcessId,
        status: MemberStatus,
        incarnation: u64,
    },
}

/// A structured observability event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityEvent {
    pub event_id: EventId,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ObservabilityEvent {
    /// Create an event with a fresh id and the current time.
    #[must_use]
    pub fn new(correlation_id: CorrelationId, kind: EventKind) -> Self {
        Self {
            event_id: EventId::new(),
            correlation_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Routing decision for a message, correlated by its id.
    #[must_use]
    pub fn routing(
        message_id: &MessageId,
        destination: &AgentId,
        guarantee: DeliveryGuarantee,
        decision: RouteDecision,
    ) -> Self {
        Self::new(
            CorrelationId::from(message_id),
            EventKind::RoutingDecision {
                message_id: message_id.clone(),
                destination: destination.clone(),
                guarantee,
                decision,
            },
        )
    }

    /// Circuit transition for a destination.
    #[must_use]
    pub fn circuit(
        correlation_id: CorrelationId,
        destination: &ProcessId,
        from: CircuitState,
        to: CircuitState,
        consecutive_failures: u32,
    ) -> Self {
        Self::new(
            correlation_id,
            EventKind::CircuitTransition {
                destination: destination.clone(),
                from,
                to,
                consecutive_failures,
            },
        )
    }

    /// Partition classification change.
    #[must_use]
    pub fn partition(from: PartitionState, to: PartitionState, alive: usize, quorum: usize) -> Self {
        Self::new(
            CorrelationId::generate(),
            EventKind::PartitionTransition {
                from,
                to,
                alive,
                quorum,
            },
        )
    }

    #[must_use]
    pub fn supervisor_restart(
        supervisor: impl Into<String>,
        failed: impl Into<String>,
        strategy: impl Into<String>,
        restarted: Vec<String>,
    ) -> Self {
        Self::new(
            CorrelationId::generate(),
            EventKind::SupervisorRestart {
                supervisor: supervisor.into(),
                failed: failed.into(),
                strategy: strategy.into(),
                restarted,
            },
        )
    }

    #[must_use]
    pub fn supervisor_escalation(
        supervisor: impl Into<String>,
        failed: impl Into<String>,
        parent: Option<String>,
    ) -> Self {
        Self::new(
            CorrelationId::generate(),
            EventKind::SupervisorEscalation {
                supervisor: supervisor.into(),
                failed: failed.into(),
                parent,
            },
        )
    }

    /// Membership change about one peer.
    #[must_use]
    pub fn membership(process: &ProcessId, status: MemberStatus, incarnation: u64) -> Self {
        Self::new(
            CorrelationId::generate(),
            EventKind::MembershipChange {
                process: process.clone(),
                status,
                incarnation,
            },
        )
    }

    /// Stable snake_case name of the event kind.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match &self.kind {
            EventKind::RoutingDecision { .. } => "routing_decision",
            EventKind::CircuitTransition { .. } => "circuit_transition",
            EventKind::PartitionTransition { .. } => "partition_transition",
            EventKind::SupervisorRestart { .. } => "supervisor_restart",
            EventKind::SupervisorEscalation { .. } => "supervisor_escalation",
            EventKind::MembershipChange { .. } => "membership_change",
        }
    }
}
