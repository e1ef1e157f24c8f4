//! Shared vocabulary for murmur.
//!
//! - **Identifiers**: process, agent, conversation, message, and correlation ids
//! - **Vector clocks**: causal ordering for registry writes
//! - **State enums**: member status, partition state, circuit state, guarantees
//! - **Errors**: one typed error enum for every crate
//! - **Configuration**: TOML-backed node settings

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod result;
pub mod types;

pub use clock::{Causality, VectorClock};
pub use config::{
    CircuitConfig, ConversationConfig, DeliveryConfig, MembershipConfig, NodeConfig,
    PartitionConfig, RegistryConfig, StoreConfig, SupervisorConfig,
};
pub use error::Error;
pub use ids::{AgentId, ConversationId, CorrelationId, MessageId, ProcessId, ProcessIdentity};
pub use result::{Result, ResultExt};
pub use types::{CircuitState, DeliveryGuarantee, MemberStatus, PartitionState};
