//! Digest exchange between two registries.
//!
//! The initiator sends its digest, merges what the peer returns, then pushes
//! back whatever the peer's digest shows it is missing.

use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use murmur_core::{Error, ProcessIdentity, Result};

use crate::registry::AgentRegistry;
use crate::transport::{AntiEntropyRequest, AntiEntropyResponse, ClusterTransport};

/// Answer a peer's digest exchange.
pub async fn answer(registry: &AgentRegistry, request: AntiEntropyRequest) -> AntiEntropyResponse {
    let merged = registry.merge(request.entries).await;
    if merged > 0 {
        debug!(peer = %request.sender, merged, "merged entries pushed by peer");
    }
    AntiEntropyResponse {
        entries: registry.entries_newer_than(&request.digest).await,
        digest: registry.digest().await,
    }
}

/// Run one full exchange with `peer`. Returns entries merged locally.
///
/// # Errors
///
/// `Error::Transport` if the peer fails or does not answer in time.
pub async fn exchange(
    registry: &AgentRegistry,
    transport: &dyn ClusterTransport,
    peer: &ProcessIdentity,
    limit: Duration,
) -> Result<usize> {
    let request = AntiEntropyRequest {
        sender: registry.local().clone(),
        digest: registry.digest().await,
        entries: Vec::new(),
    };
    let response = timeout(limit, transport.anti_entropy(peer.addr, request))
        .await
        .map_err(|_| Error::transport(peer, "anti-entropy timed out"))??;

    let merged = registry.merge(response.entries).await;
    let missing = registry.entries_newer_than(&response.digest).await;
    let pushed = missing.len();
    if !missing.is_empty() {
        let push = AntiEntropyRequest {
            sender: registry.local().clone(),
            digest: registry.digest().await,
            entries: missing,
        };
        timeout(limit, transport.anti_entropy(peer.addr, push))
            .await
            .map_err(|_| Error::transport(peer, "anti-entropy push timed out"))??;
    }
    debug!(peer = %peer, merged, pushed, "anti-entropy complete");
    Ok(merged)
}
