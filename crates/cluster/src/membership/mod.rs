//! SWIM-style cluster membership.
//!
//! A single task owns the state and publishes an `Arc<MembershipView>` after
//! every change; readers never block on probing. [`Membership`] is the cheap,
//! cloneable handle.

mod state;
mod task;
mod view;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::debug;

use murmur_core::{Error, MembershipConfig, ProcessId, ProcessIdentity, Result};
use murmur_events::EventBus;

use crate::gossip::GossipPayload;
use crate::registry::AgentRegistry;
use crate::transport::ClusterTransport;

pub use state::{MembershipState, supersedes};
pub use view::{Member, MembershipEvent, MembershipView};

use task::{Command, MembershipTask};

const COMMAND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

/// Handle to the membership protocol task.
#[derive(Clone)]
pub struct Membership {
    local: ProcessIdentity,
    config: MembershipConfig,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<Arc<MembershipView>>,
    events: broadcast::Sender<MembershipEvent>,
    transport: Arc<dyn ClusterTransport>,
}

impl Membership {
    /// Spawn the protocol task. Must be called inside a Tokio runtime.
    ///
    /// `incarnation` lets a restarted process continue above its previous
    /// life's incarnation.
    #[must_use]
    pub fn start(
        local: ProcessIdentity,
        incarnation: u64,
        config: MembershipConfig,
        transport: Arc<dyn ClusterTransport>,
        registry: Arc<AgentRegistry>,
        bus: EventBus,
    ) -> Self {
        let state = MembershipState::new(local.clone(), incarnation, config.clone());
        let (view_tx, view) = watch::channel(Arc::new(state.view().clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);

        let task = MembershipTask::new(
            state,
            config.clone(),
            Arc::clone(&transport),
            registry,
            bus,
            view_tx,
            events.clone(),
            commands.clone(),
        );
        tokio::spawn(task.run(rx));

        Self {
            local,
            config,
            commands,
            view,
            events,
            transport,
        }
    }

    #[must_use]
    pub const fn local(&self) -> &ProcessIdentity {
        &self.local
    }

    /// Contact seeds. Succeeds if any answers, or if there are none.
    ///
    /// # Errors
    ///
    /// `Error::JoinFailed` when seeds were given and none answered. The
    /// process keeps running as a singleton and may be contacted later.
    pub async fn join(&self, seeds: Vec<SocketAddr>) -> Result<usize> {
        self.request(|reply| Command::Join { seeds, reply }).await?
    }

    /// Announce departure to a few peers and stop the protocol task.
    ///
    /// # Errors
    ///
    /// Fails only if the task has already stopped.
    pub async fn leave(&self) -> Result<()> {
        let outgoing = self.request(|reply| Command::Leave { reply }).await?;
        let probe_timeout = self.config.probe_timeout();
        let sends = outgoing.into_iter().map(|(addr, payload)| {
            let transport = Arc::clone(&self.transport);
            async move {
                match timeout(probe_timeout, transport.ping(addr, payload)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => debug!(peer = %addr, error = %e, "leave announcement failed"),
                    Err(_) => debug!(peer = %addr, "leave announcement timed out"),
                }
            }
        });
        join_all(sends).await;
        self.stop().await;
        Ok(())
    }

    /// Stop the protocol task without announcing anything.
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }

    #[must_use]
    pub fn is_alive(&self, process: &ProcessId) -> bool {
        self.view.borrow().is_alive(process)
    }

    #[must_use]
    pub fn alive_processes(&self) -> BTreeSet<ProcessIdentity> {
        self.view.borrow().alive_processes()
    }

    /// Push stream of membership changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Current view.
    #[must_use]
    pub fn snapshot(&self) -> Arc<MembershipView> {
        self.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<MembershipView>> {
        self.view.clone()
    }

    /// Answer a ping: absorb its gossip and return our ack payload.
    ///
    /// # Errors
    ///
    /// Fails only if the task has stopped.
    pub async fn handle_ping(&self, payload: GossipPayload) -> Result<GossipPayload> {
        self.request(|reply| Command::Inbound { payload, reply }).await
    }

    /// Probe `target` on behalf of the requester and return its ack.
    ///
    /// # Errors
    ///
    /// `Error::Transport` if the target does not answer within the probe
    /// timeout.
    pub async fn handle_ping_req(
        &self,
        target: ProcessIdentity,
        payload: GossipPayload,
    ) -> Result<GossipPayload> {
        self.handle_ping(payload).await?;
        let target_id = target.id.clone();
        let ours = self
            .request(|reply| Command::Outgoing {
                target: Some(target_id),
                reply,
            })
            .await?;
        let ack = timeout(
            self.config.probe_timeout(),
            self.transport.ping(target.addr, ours),
        )
        .await
        .map_err(|_| Error::transport(&target, "relayed probe timed out"))??;
        let _ = self
            .commands
            .send(Command::Acked {
                payload: ack.clone(),
            })
            .await;
        Ok(ack)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> Error {
        Error::transport(&self.local, "membership task has stopped")
    }
}
