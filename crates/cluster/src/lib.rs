//! Cluster layer for murmur: who is alive, where agents live, and whether
//! this process may act authoritatively.
//!
//! - [`membership`]: SWIM-style probing with piggybacked gossip
//! - [`registry`]: vector-clock CRDT mapping agents to hosting processes
//! - [`partition`]: majority/minority/isolated classification and healing
//! - [`anti_entropy`]: digest exchange used on join and on heal
//! - [`store`]: local snapshot persistence
//!
//! The network itself stays behind [`ClusterTransport`].

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(unsafe_code)]

pub mod anti_entropy;
pub mod gossip;
pub mod membership;
pub mod partition;
pub mod registry;
pub mod store;
pub mod transport;

pub use gossip::{GossipPayload, MemberDelta, TransmitQueue, retransmit_limit};
pub use membership::{Member, Membership, MembershipEvent, MembershipView};
pub use partition::{PartitionManager, PartitionTracker};
pub use registry::{
    AgentRegistry, RegistrationEntry, RegistryDigest, RegistryState, WriteMode, WriteOutcome,
    resolve,
};
pub use store::{FileStateStore, InMemoryStateStore, NodeSnapshot, StateStore};
pub use transport::{AntiEntropyRequest, AntiEntropyResponse, ClusterTransport};
