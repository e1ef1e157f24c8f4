//! Error types for the events crate.

use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Event store operation failed.
    #[error("event store operation '{operation}' failed: {reason}")]
    StoreFailed { operation: String, reason: String },

    /// Invalid event data.
    #[error("invalid event: {reason}")]
    InvalidEvent { reason: String },

    /// The subscriber fell behind and missed events.
    #[error("subscriber lagged behind by {skipped} event(s)")]
    Lagged { skipped: u64 },

    /// Channel closed.
    #[error("event channel closed")]
    ChannelClosed,

    /// Serialization error.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl Error {
    /// Create a store failed error.
    pub fn store_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid event error.
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::store_failed("append", "full");
        assert_eq!(err.to_string(), "event store operation 'append' failed: full");
        assert_eq!(
            Error::Lagged { skipped: 3 }.to_string(),
            "subscriber lagged behind by 3 event(s)"
        );
    }
}
