//! Router-to-router calls.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use murmur_cluster::RegistrationEntry;
use murmur_core::{AgentId, Result};

use crate::delivery::FailureReason;
use crate::envelope::Envelope;

/// What the receiving router did with a forwarded envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundOutcome {
    Delivered,
    Buffered,
    Duplicate,
}

/// Reply to a forward. Transport failures are the `Err` of the call itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "detail", rename_all = "snake_case")]
pub enum ForwardReply {
    Accepted(InboundOutcome),
    Rejected(FailureReason),
}

#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// Hand an envelope to the router at `target` and wait for its reply.
    async fn forward(&self, target: SocketAddr, envelope: Envelope) -> Result<ForwardReply>;

    /// Ask `target` whether it knows where `agent` lives.
    async fn locate(&self, target: SocketAddr, agent: AgentId)
    -> Result<Option<RegistrationEntry>>;
}
