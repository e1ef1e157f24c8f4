//! Wire protocol and TCP transport.
//!
//! One request and one reply per connection. Each message is a `u32`
//! big-endian length followed by that many bytes of JSON.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use murmur_cluster::{
    AntiEntropyRequest, AntiEntropyResponse, ClusterTransport, GossipPayload, RegistrationEntry,
};
use murmur_core::{AgentId, Error, ProcessIdentity, Result};
use murmur_router::{Envelope, ForwardReply, RemoteTransport};

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// A request from one process to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Ping {
        payload: GossipPayload,
    },
    PingReq {
        target: ProcessIdentity,
        payload: GossipPayload,
    },
    AntiEntropy {
        request: AntiEntropyRequest,
    },
    Forward {
        envelope: Envelope,
    },
    Locate {
        agent_id: AgentId,
    },
}

impl Frame {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::PingReq { .. } => "ping_req",
            Self::AntiEntropy { .. } => "anti_entropy",
            Self::Forward { .. } => "forward",
            Self::Locate { .. } => "locate",
        }
    }
}

/// The answer to a [`Frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Ack { payload: GossipPayload },
    AntiEntropy { response: AntiEntropyResponse },
    Forward { outcome: ForwardReply },
    Located { entry: Option<RegistrationEntry> },
    Error { reason: String },
}

/// Something that answers inbound frames, normally a [`crate::Node`].
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle(&self, frame: Frame) -> Reply;
}

/// Write one length-prefixed JSON message.
///
/// # Errors
///
/// `Error::Codec` if the value does not serialize or is too large,
/// `Error::Io` if the write fails.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value).map_err(|e| Error::codec(e.to_string()))?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_BYTES)
        .ok_or_else(|| Error::codec(format!("frame of {} bytes is too large", body.len())))?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON message.
///
/// # Errors
///
/// `Error::Codec` for an oversized or malformed message, `Error::Io` if
/// the read fails.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(Error::codec(format!("frame of {len} bytes is too large")));
    }
    let mut body = vec![0; len as usize];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| Error::codec(e.to_string()))
}

/// Client side of the wire protocol.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpTransport {
    #[must_use]
    pub const fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Send one frame and wait for its reply.
    ///
    /// # Errors
    ///
    /// `Error::Transport` if the peer is unreachable, times out, or answers
    /// with an error reply.
    pub async fn call(&self, target: SocketAddr, frame: &Frame) -> Result<Reply> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| Error::transport(target, "connect timed out"))?
            .map_err(|e| Error::transport(target, e.to_string()))?;
        let exchange = async {
            write_frame(&mut stream, frame).await?;
            read_frame::<_, Reply>(&mut stream).await
        };
        let reply = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| Error::transport(target, format!("{} timed out", frame.kind())))?
            .map_err(|e| match e {
                Error::Io(io) => Error::transport(target, io.to_string()),
                other => other,
            })?;
        match reply {
            Reply::Error { reason } => Err(Error::transport(target, reason)),
            other => Ok(other),
        }
    }
}

fn unexpected(target: SocketAddr, expected: &str) -> Error {
    Error::transport(target, format!("unexpected reply, wanted {expected}"))
}

/// Map a reply onto the call that asked for it. Shared by every transport
/// that speaks [`Frame`]s.
pub(crate) mod replies {
    use super::{
        AntiEntropyResponse, Error, ForwardReply, GossipPayload, RegistrationEntry, Reply,
        SocketAddr, unexpected,
    };

    pub fn ack(target: SocketAddr, reply: Reply) -> Result<GossipPayload, Error> {
        match reply {
            Reply::Ack { payload } => Ok(payload),
            _ => Err(unexpected(target, "ack")),
        }
    }

    pub fn anti_entropy(target: SocketAddr, reply: Reply) -> Result<AntiEntropyResponse, Error> {
        match reply {
            Reply::AntiEntropy { response } => Ok(response),
            _ => Err(unexpected(target, "anti_entropy")),
        }
    }

    pub fn forward(target: SocketAddr, reply: Reply) -> Result<ForwardReply, Error> {
        match reply {
            Reply::Forward { outcome } => Ok(outcome),
            _ => Err(unexpected(target, "forward")),
        }
    }

    pub fn located(
        target: SocketAddr,
        reply: Reply,
    ) -> Result<Option<RegistrationEntry>, Error> {
        match reply {
            Reply::Located { entry } => Ok(entry),
            _ => Err(unexpected(target, "located")),
        }
    }
}

#[async_trait]
impl ClusterTransport for TcpTransport {
    async fn ping(&self, target: SocketAddr, payload: GossipPayload) -> Result<GossipPayload> {
        let reply = self.call(target, &Frame::Ping { payload }).await?;
        replies::ack(target, reply)
    }

    async fn ping_req(
        &self,
        relay: SocketAddr,
        target: ProcessIdentity,
        payload: GossipPayload,
    ) -> Result<GossipPayload> {
        let reply = self.call(relay, &Frame::PingReq { target, payload }).await?;
        replies::ack(relay, reply)
    }

    async fn anti_entropy(
        &self,
        target: SocketAddr,
        request: AntiEntropyRequest,
    ) -> Result<AntiEntropyResponse> {
        let reply = self.call(target, &Frame::AntiEntropy { request }).await?;
        replies::anti_entropy(target, reply)
    }
}

#[async_trait]
impl RemoteTransport for TcpTransport {
    async fn forward(&self, target: SocketAddr, envelope: Envelope) -> Result<ForwardReply> {
        let reply = self.call(target, &Frame::Forward { envelope }).await?;
        replies::forward(target, reply)
    }

    async fn locate(
        &self,
        target: SocketAddr,
        agent: AgentId,
    ) -> Result<Option<RegistrationEntry>> {
        let reply = self.call(target, &Frame::Locate { agent_id: agent }).await?;
        replies::located(target, reply)
    }
}

/// Accept connections until `shutdown` fires, answering each with `handler`.
pub async fn serve(listener: TcpListener, handler: Arc<dyn FrameHandler>, shutdown: Arc<Notify>) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "listening"),
        Err(e) => warn!(error = %e, "listening on unknown address"),
    }
    loop {
        tokio::select! {
            () = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = answer(stream, handler.as_ref()).await {
                            debug!(%peer, error = %e, "connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    info!("listener stopped");
}

async fn answer(mut stream: TcpStream, handler: &dyn FrameHandler) -> Result<()> {
    let reply = match read_frame::<_, Frame>(&mut stream).await {
        Ok(frame) => handler.handle(frame).await,
        Err(e @ Error::Codec { .. }) => Reply::Error {
            reason: e.to_string(),
        },
        Err(e) => return Err(e),
    };
    write_frame(&mut stream, &reply).await
}
