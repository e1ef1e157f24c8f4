//! Network seam for the membership protocol and anti-entropy.
//!
//! Implementations live outside this crate (TCP, in-process loopback). Every
//! call is a single request/response; callers bound them with timeouts.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use murmur_core::{ProcessIdentity, Result};

use crate::gossip::GossipPayload;
use crate::registry::{RegistrationEntry, RegistryDigest};

/// First half of a digest exchange: what the sender has, plus anything it
/// already knows the receiver is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiEntropyRequest {
    pub sender: ProcessIdentity,
    pub digest: RegistryDigest,
    #[serde(default)]
    pub entries: Vec<RegistrationEntry>,
}

/// Entries the requester is missing, plus the responder's digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiEntropyResponse {
    pub entries: Vec<RegistrationEntry>,
    pub digest: RegistryDigest,
}

/// Outbound cluster calls.
#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    /// Direct probe; the answer is the target's ack payload.
    async fn ping(&self, target: SocketAddr, payload: GossipPayload) -> Result<GossipPayload>;

    /// Ask `relay` to probe `target` on our behalf; the answer is the
    /// target's ack as seen by the relay.
    async fn ping_req(
        &self,
        relay: SocketAddr,
        target: ProcessIdentity,
        payload: GossipPayload,
    ) -> Result<GossipPayload>;

    /// One digest exchange with a peer.
    async fn anti_entropy(
        &self,
        target: SocketAddr,
        request: AntiEntropyRequest,
    ) -> Result<AntiEntropyResponse>;
}
