//! Core error types for murmur operations.
//!
//! All errors are explicit and typed. Transient variants are retried inside
//! the delivery policy; structural variants surface to the caller at once.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for murmur operations.
#[derive(Debug, Error)]
pub enum Error {
    // Routing
    #[error("unknown destination: agent '{agent_id}' could not be located")]
    UnknownDestination { agent_id: String },

    #[error("delivery of '{message_id}' timed out after {elapsed_ms}ms")]
    DeliveryTimeout { message_id: String, elapsed_ms: u64 },

    #[error("circuit open for destination '{destination}'")]
    CircuitOpen { destination: String },

    #[error("delivery of '{message_id}' was cancelled")]
    Cancelled { message_id: String },

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    // Conversations
    #[error("conversation '{conversation_id}' buffer full ({capacity} messages)")]
    ConversationOverflow {
        conversation_id: String,
        capacity: usize,
    },

    #[error("conversation '{conversation_id}' is closed")]
    ConversationClosed { conversation_id: String },

    // Cluster
    #[error("partition degraded ({state}): {operation} refused")]
    PartitionDegraded { state: String, operation: String },

    #[error("join failed: none of {attempted} seed(s) answered")]
    JoinFailed { attempted: usize },

    #[error("agent '{agent_id}' is not registered")]
    AgentNotRegistered { agent_id: String },

    // Supervision
    #[error("'{entity}' exceeded {max_restarts} restarts within {window_ms}ms")]
    RestartLimitExceeded {
        entity: String,
        max_restarts: u32,
        window_ms: u64,
    },

    #[error("supervised entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("'{entity}' failed to start: {reason}")]
    StartFailed { entity: String, reason: String },

    // Plumbing
    #[error("transport error talking to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    #[error("codec error: {reason}")]
    Codec { reason: String },

    #[error("state store error at '{path}': {reason}")]
    Storage { path: PathBuf, reason: String },

    #[error("invalid configuration: {field} - {reason}")]
    Config { field: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an unknown destination error.
    pub fn unknown_destination(agent_id: impl Into<String>) -> Self {
        Self::UnknownDestination {
            agent_id: agent_id.into(),
        }
    }

    /// Create a delivery timeout error.
    pub fn delivery_timeout(message_id: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::DeliveryTimeout {
            message_id: message_id.into(),
            elapsed_ms,
        }
    }

    /// Create a circuit open error.
    pub fn circuit_open(destination: impl Into<String>) -> Self {
        Self::CircuitOpen {
            destination: destination.into(),
        }
    }

    /// Create an invalid envelope error.
    pub fn invalid_envelope(reason: impl Into<String>) -> Self {
        Self::InvalidEnvelope {
            reason: reason.into(),
        }
    }

    /// Create a partition degraded error.
    pub fn partition_degraded(state: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::PartitionDegraded {
            state: state.into(),
            operation: operation.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(peer: impl ToString, reason: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a codec error.
    pub fn codec(reason: impl Into<String>) -> Self {
        Self::Codec {
            reason: reason.into(),
        }
    }

    /// Create a state store error.
    pub fn storage(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Transient failures are worth another attempt under a retrying policy.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::DeliveryTimeout { .. } | Self::Io(_)
        )
    }

    /// Structural failures cannot be fixed by retrying and surface immediately.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UnknownDestination { .. }
                | Self::ConversationOverflow { .. }
                | Self::ConversationClosed { .. }
                | Self::InvalidEnvelope { .. }
        )
    }
}
