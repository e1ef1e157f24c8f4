//! In-process network for running whole clusters inside one runtime.
//!
//! Frames are JSON round-tripped exactly as on TCP, so everything a node
//! sends is also checked against the wire format. Links can be cut per
//! direction, processes can be isolated, and replies can be dropped after
//! the request was handled (the sender sees a lost acknowledgement).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tracing::trace;

use murmur_cluster::{
    AntiEntropyRequest, AntiEntropyResponse, ClusterTransport, GossipPayload, RegistrationEntry,
};
use murmur_core::{AgentId, Error, ProcessIdentity, Result};
use murmur_router::{Envelope, ForwardReply, RemoteTransport};

use crate::net::{Frame, FrameHandler, Reply, replies};

#[derive(Default)]
struct Links {
    handlers: HashMap<SocketAddr, Weak<dyn FrameHandler>>,
    cut: HashSet<(SocketAddr, SocketAddr)>,
    isolated: HashSet<SocketAddr>,
    lost_replies: HashMap<SocketAddr, u32>,
}

#[derive(Default)]
pub struct LoopbackNetwork {
    links: Mutex<Links>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport whose requests originate from `from`.
    #[must_use]
    pub fn transport(self: &Arc<Self>, from: SocketAddr) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            from,
            network: Arc::clone(self),
        })
    }

    /// Route frames for `addr` to `handler`. Held weakly.
    pub fn attach(&self, addr: SocketAddr, handler: &Arc<dyn FrameHandler>) {
        self.with_links(|links| {
            links.handlers.insert(addr, Arc::downgrade(handler));
        });
    }

    pub fn detach(&self, addr: SocketAddr) {
        self.with_links(|links| {
            links.handlers.remove(&addr);
        });
    }

    /// Drop traffic in both directions between `a` and `b`.
    pub fn cut(&self, a: SocketAddr, b: SocketAddr) {
        self.with_links(|links| {
            links.cut.insert((a, b));
            links.cut.insert((b, a));
        });
    }

    /// Cut every link between the two groups.
    pub fn partition(&self, left: &[SocketAddr], right: &[SocketAddr]) {
        for a in left {
            for b in right {
                self.cut(*a, *b);
            }
        }
    }

    /// Cut `addr` off from everyone.
    pub fn isolate(&self, addr: SocketAddr) {
        self.with_links(|links| {
            links.isolated.insert(addr);
        });
    }

    /// Restore every cut link and isolated process.
    pub fn heal(&self) {
        self.with_links(|links| {
            links.cut.clear();
            links.isolated.clear();
        });
    }

    /// Handle the next `count` requests to `addr` but lose their replies.
    pub fn lose_replies(&self, addr: SocketAddr, count: u32) {
        self.with_links(|links| {
            links.lost_replies.insert(addr, count);
        });
    }

    async fn call(&self, from: SocketAddr, to: SocketAddr, frame: &Frame) -> Result<Reply> {
        let handler = self.with_links(|links| {
            if links.isolated.contains(&from)
                || links.isolated.contains(&to)
                || links.cut.contains(&(from, to))
            {
                return Err(Error::transport(to, "link cut"));
            }
            links
                .handlers
                .get(&to)
                .and_then(Weak::upgrade)
                .ok_or_else(|| Error::transport(to, "connection refused"))
        })?;
        trace!(%from, %to, frame = frame.kind(), "loopback request");

        let bytes = serde_json::to_vec(frame).map_err(|e| Error::codec(e.to_string()))?;
        let frame: Frame = serde_json::from_slice(&bytes).map_err(|e| Error::codec(e.to_string()))?;
        let reply = handler.handle(frame).await;

        let lost = self.with_links(|links| match links.lost_replies.get_mut(&to) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        });
        if lost {
            return Err(Error::transport(to, "connection reset"));
        }

        let bytes = serde_json::to_vec(&reply).map_err(|e| Error::codec(e.to_string()))?;
        match serde_json::from_slice(&bytes).map_err(|e| Error::codec(e.to_string()))? {
            Reply::Error { reason } => Err(Error::transport(to, reason)),
            reply => Ok(reply),
        }
    }

    fn with_links<T>(&self, f: impl FnOnce(&mut Links) -> T) -> T {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut links)
    }
}

/// One process's end of a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    from: SocketAddr,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    async fn ping(&self, target: SocketAddr, payload: GossipPayload) -> Result<GossipPayload> {
        let reply = self
            .network
            .call(self.from, target, &Frame::Ping { payload })
            .await?;
        replies::ack(target, reply)
    }

    async fn ping_req(
        &self,
        relay: SocketAddr,
        target: ProcessIdentity,
        payload: GossipPayload,
    ) -> Result<GossipPayload> {
        let reply = self
            .network
            .call(self.from, relay, &Frame::PingReq { target, payload })
            .await?;
        replies::ack(relay, reply)
    }

    async fn anti_entropy(
        &self,
        target: SocketAddr,
        request: AntiEntropyRequest,
    ) -> Result<AntiEntropyResponse> {
        let reply = self
            .network
            .call(self.from, target, &Frame::AntiEntropy { request })
            .await?;
        replies::anti_entropy(target, reply)
    }
}

#[async_trait]
impl RemoteTransport for LoopbackTransport {
    async fn forward(&self, target: SocketAddr, envelope: Envelope) -> Result<ForwardReply> {
        let reply = self
            .network
            .call(self.from, target, &Frame::Forward { envelope })
            .await?;
        replies::forward(target, reply)
    }

    async fn locate(
        &self,
        target: SocketAddr,
        agent: AgentId,
    ) -> Result<Option<RegistrationEntry>> {
        let reply = self
            .network
            .call(self.from, target, &Frame::Locate { agent_id: agent })
            .await?;
        replies::located(target, reply)
    }
}
