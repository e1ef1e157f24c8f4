//! Delivery guarantee bookkeeping.
//!
//! Sender side: retry policy, per-sender sequence stamping, and the in-flight
//! table that makes deliveries cancellable. Receiver side: the message-id
//! dedup cache (at-least-once) and applied-sequence tracking (exactly-once).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use murmur_core::{AgentId, DeliveryConfig, DeliveryGuarantee, Error, MessageId, ProcessId};

/// Why a message could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnknownDestination,
    PartitionDegraded,
    CircuitOpen,
    Timeout,
    NetworkError,
    MessageTooLarge,
    InvalidMessage,
    ConversationOverflow,
    ConversationClosed,
    QueueFull,
    AgentNotResponding,
    Cancelled,
}

impl FailureReason {
    /// Map an error to the reason reported to the caller.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::UnknownDestination { .. } | Error::AgentNotRegistered { .. } => {
                Self::UnknownDestination
            }
            Error::PartitionDegraded { .. } => Self::PartitionDegraded,
            Error::CircuitOpen { .. } => Self::CircuitOpen,
            Error::DeliveryTimeout { .. } => Self::Timeout,
            Error::InvalidEnvelope { reason } if reason.contains("byte limit") => {
                Self::MessageTooLarge
            }
            Error::InvalidEnvelope { .. } | Error::Codec { .. } => Self::InvalidMessage,
            Error::ConversationOverflow { .. } => Self::ConversationOverflow,
            Error::ConversationClosed { .. } => Self::ConversationClosed,
            Error::Cancelled { .. } => Self::Cancelled,
            _ => Self::NetworkError,
        }
    }

    /// Reasons the sender may overcome by trying again later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UnknownDestination
                | Self::CircuitOpen
                | Self::Timeout
                | Self::NetworkError
                | Self::AgentNotResponding
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownDestination => "unknown_destination",
            Self::PartitionDegraded => "partition_degraded",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::MessageTooLarge => "message_too_large",
            Self::InvalidMessage => "invalid_message",
            Self::ConversationOverflow => "conversation_overflow",
            Self::ConversationClosed => "conversation_closed",
            Self::QueueFull => "queue_full",
            Self::AgentNotResponding => "agent_not_responding",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of `route`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    /// Held for later replay, or accepted into a conversation buffer.
    Queued,
    Failed(FailureReason),
}

impl DeliveryStatus {
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    #[must_use]
    pub const fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.retry_base_ms),
            factor: config.backoff_factor,
            max: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Attempts allowed for a guarantee. At-most-once gets exactly one.
    #[must_use]
    pub const fn attempts_for(&self, guarantee: DeliveryGuarantee) -> u32 {
        match guarantee {
            DeliveryGuarantee::AtMostOnce => 1,
            DeliveryGuarantee::AtLeastOnce | DeliveryGuarantee::ExactlyOnce => self.max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.base.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        if scaled.is_finite() && scaled < self.max.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max
        }
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`.
    pub fn backoff(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let spread = u64::try_from((ceiling - half).as_micros()).unwrap_or(u64::MAX);
        half + Duration::from_micros(rng.gen_range(0..=spread))
    }
}

/// Receiver-side set of recently seen message ids.
#[derive(Clone)]
pub struct DedupCache {
    seen: Cache<MessageId, ()>,
}

impl DedupCache {
    #[must_use]
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            seen: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    #[must_use]
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.dedup_capacity, config.dedup_ttl())
    }

    /// Record `id`; `true` if this is the first sighting.
    pub async fn first_seen(&self, id: &MessageId) -> bool {
        self.seen.entry(id.clone()).or_insert(()).await.is_fresh()
    }

    pub async fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains_key(id)
    }

    /// Forget `id`, so a rejected message can be retried.
    pub async fn forget(&self, id: &MessageId) {
        self.seen.invalidate(id).await;
    }

    /// Apply pending evictions.
    pub async fn upkeep(&self) {
        self.seen.run_pending_tasks().await;
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.seen.entry_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default, Clone)]
struct Applied {
    /// Every sequence below this has been applied.
    floor: u64,
    above: BTreeSet<u64>,
}

/// Receiver-side record of applied sender sequences, for exactly-once.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    applied: HashMap<AgentId, Applied>,
}

impl SequenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_applied(&self, sender: &AgentId, sequence: u64) -> bool {
        self.applied
            .get(sender)
            .is_some_and(|a| sequence < a.floor || a.above.contains(&sequence))
    }

    /// Mark applied; `false` if it already was.
    pub fn record(&mut self, sender: &AgentId, sequence: u64) -> bool {
        let applied = self.applied.entry(sender.clone()).or_default();
        if sequence < applied.floor || !applied.above.insert(sequence) {
            return false;
        }
        while applied.above.remove(&applied.floor) {
            applied.floor += 1;
        }
        true
    }

    /// Un-apply a sequence whose hand-off failed after it was recorded.
    pub fn forget(&mut self, sender: &AgentId, sequence: u64) {
        let Some(applied) = self.applied.get_mut(sender) else {
            return;
        };
        if sequence < applied.floor {
            applied.above.extend(sequence.saturating_add(1)..applied.floor);
            applied.floor = sequence;
        } else {
            applied.above.remove(&sequence);
        }
    }

    /// Sequences tracked above the contiguous floor for `sender`.
    #[must_use]
    pub fn gaps(&self, sender: &AgentId) -> usize {
        self.applied.get(sender).map_or(0, |a| a.above.len())
    }
}

/// Stamps exactly-once messages that arrive without a sender sequence.
#[derive(Debug, Default)]
pub struct SenderSequencer {
    next: Mutex<HashMap<AgentId, u64>>,
}

impl SenderSequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn next(&self, sender: &AgentId) -> u64 {
        let mut next = self.next.lock().await;
        let counter = next.entry(sender.clone()).or_insert(0);
        let sequence = *counter;
        *counter += 1;
        sequence
    }
}

/// Lifecycle of a remote delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightStatus {
    Resolving,
    Forwarding,
    Backoff,
}

#[derive(Debug, Clone)]
pub struct InFlightRecord {
    pub message_id: MessageId,
    pub destination: AgentId,
    pub attempt_count: u32,
    pub delivery_guarantee: DeliveryGuarantee,
    pub status: InFlightStatus,
    pub target: Option<ProcessId>,
    pub started_at: Instant,
    cancel: Arc<Notify>,
}

/// Remote deliveries in progress, keyed by message id.
#[derive(Debug, Default)]
pub struct InFlightTable {
    records: Mutex<HashMap<MessageId, InFlightRecord>>,
}

impl InFlightTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking. Returns the signal fired on cancellation, or `None` if
    /// the id is already in flight.
    pub async fn begin(
        &self,
        message_id: &MessageId,
        destination: &AgentId,
        guarantee: DeliveryGuarantee,
    ) -> Option<Arc<Notify>> {
        let mut records = self.records.lock().await;
        if records.contains_key(message_id) {
            return None;
        }
        let cancel = Arc::new(Notify::new());
        records.insert(
            message_id.clone(),
            InFlightRecord {
                message_id: message_id.clone(),
                destination: destination.clone(),
                attempt_count: 0,
                delivery_guarantee: guarantee,
                status: InFlightStatus::Resolving,
                target: None,
                started_at: Instant::now(),
                cancel: Arc::clone(&cancel),
            },
        );
        Some(cancel)
    }

    /// Update a record. `false` if it was cancelled meanwhile.
    pub async fn update(
        &self,
        message_id: &MessageId,
        status: InFlightStatus,
        target: Option<&ProcessId>,
    ) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(message_id) else {
            return false;
        };
        if status == InFlightStatus::Forwarding {
            record.attempt_count += 1;
        }
        record.status = status;
        if let Some(target) = target {
            record.target = Some(target.clone());
        }
        true
    }

    pub async fn is_active(&self, message_id: &MessageId) -> bool {
        self.records.lock().await.contains_key(message_id)
    }

    /// Remove a finished delivery.
    pub async fn finish(&self, message_id: &MessageId) -> Option<InFlightRecord> {
        self.records.lock().await.remove(message_id)
    }

    /// Remove a delivery and wake its retry loop. `false` if unknown.
    pub async fn cancel(&self, message_id: &MessageId) -> bool {
        match self.records.lock().await.remove(message_id) {
            Some(record) => {
                record.cancel.notify_one();
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<InFlightRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}
