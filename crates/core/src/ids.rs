//! Identifiers shared across the cluster.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from an existing string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Stable identifier of a participating process.
    ProcessId
);

string_id!(
    /// Identifier of an agent hosted somewhere in the cluster.
    AgentId
);

string_id!(
    /// Identifier of a conversation between agents.
    ConversationId
);

string_id!(
    /// Unique identifier of a message envelope.
    MessageId
);

string_id!(
    /// Ties an observability event back to the message or failure behind it.
    CorrelationId
);

impl ProcessId {
    /// Generate a fresh process id for a process started without one.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("proc-{}", Uuid::new_v4()))
    }
}

impl MessageId {
    /// Generate a fresh message id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("msg-{}", Uuid::new_v4()))
    }
}

impl CorrelationId {
    /// Generate a fresh correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("corr-{}", Uuid::new_v4()))
    }
}

impl From<&MessageId> for CorrelationId {
    fn from(id: &MessageId) -> Self {
        Self(id.as_str().to_string())
    }
}

/// A process taking part in the cluster: its stable id plus the address used
/// for gossip and forwarding.
///
/// Ordering and equality consider the id first, which makes the identity
/// usable as a deterministic tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    /// Stable process id.
    pub id: ProcessId,
    /// Gossip and forwarding address.
    pub addr: SocketAddr,
}

impl ProcessIdentity {
    /// Create a new process identity.
    #[must_use]
    pub fn new(id: impl Into<ProcessId>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            addr,
        }
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}
