//! Small state enums shared between the cluster, router, and event crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Local belief about a peer's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Answering probes.
    Alive,
    /// Missed a direct and an indirect probe; awaiting refutation.
    Suspect,
    /// Suspicion timed out.
    Dead,
    /// Left the cluster gracefully.
    Left,
}

impl MemberStatus {
    /// Alive and suspected members still count as reachable.
    #[must_use]
    pub const fn is_reachable(self) -> bool {
        matches!(self, Self::Alive | Self::Suspect)
    }

    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Suspect => "suspect",
            Self::Dead => "dead",
            Self::Left => "left",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How this process classifies its view of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    /// At least a quorum of processes is reachable.
    Majority,
    /// Some peers are reachable, but fewer than a quorum.
    Minority,
    /// Only this process is reachable.
    Isolated,
}

impl PartitionState {
    /// Classify an alive count (self included) against a quorum size.
    ///
    /// A quorum of one makes a lone process authoritative.
    #[must_use]
    pub const fn classify(alive: usize, quorum: usize) -> Self {
        if alive >= quorum {
            Self::Majority
        } else if alive <= 1 {
            Self::Isolated
        } else {
            Self::Minority
        }
    }

    /// Anything other than `Majority`.
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        !matches!(self, Self::Majority)
    }

    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Majority => "majority",
            Self::Minority => "minority",
            Self::Isolated => "isolated",
        }
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker position for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One trial call decides between `Closed` and `Open`.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Delivery guarantee selected per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Single attempt, no retry, no dedup bookkeeping.
    AtMostOnce,
    /// Retried with backoff; receivers deduplicate by message id.
    #[default]
    AtLeastOnce,
    /// Idempotent content tagged with a per-sender sequence.
    ExactlyOnce,
}

impl DeliveryGuarantee {
    /// Guarantees that need an acknowledgement before counting as delivered.
    #[must_use]
    pub const fn requires_ack(self) -> bool {
        matches!(self, Self::AtLeastOnce | Self::ExactlyOnce)
    }
}

impl fmt::Display for DeliveryGuarantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AtMostOnce => "at_most_once",
            Self::AtLeastOnce => "at_least_once",
            Self::ExactlyOnce => "exactly_once",
        })
    }
}
