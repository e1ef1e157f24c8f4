//! The single task that owns membership state.
//!
//! Probes run as spawned futures and report back through the command channel,
//! so the loop never waits on the network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, select_ok};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use murmur_core::{Error, MembershipConfig, ProcessId, ProcessIdentity, Result};
use murmur_events::{EventBus, ObservabilityEvent};

use crate::gossip::GossipPayload;
use crate::membership::state::MembershipState;
use crate::membership::view::{MembershipEvent, MembershipView};
use crate::registry::AgentRegistry;
use crate::transport::ClusterTransport;

pub(crate) enum Command {
    Join {
        seeds: Vec<SocketAddr>,
        reply: oneshot::Sender<Result<usize>>,
    },
    JoinDone {
        attempted: usize,
        acks: Vec<GossipPayload>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Inbound {
        payload: GossipPayload,
        reply: oneshot::Sender<GossipPayload>,
    },
    Outgoing {
        target: Option<ProcessId>,
        reply: oneshot::Sender<GossipPayload>,
    },
    Acked {
        payload: GossipPayload,
    },
    ProbeDone {
        target: ProcessId,
        ack: Option<GossipPayload>,
    },
    Leave {
        reply: oneshot::Sender<Vec<(SocketAddr, GossipPayload)>>,
    },
    Stop,
}

pub(crate) struct MembershipTask {
    state: MembershipState,
    config: MembershipConfig,
    transport: Arc<dyn ClusterTransport>,
    registry: Arc<AgentRegistry>,
    bus: EventBus,
    view_tx: watch::Sender<Arc<MembershipView>>,
    event_tx: broadcast::Sender<MembershipEvent>,
    commands: mpsc::Sender<Command>,
    rng: StdRng,
    probing: bool,
}

impl MembershipTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        state: MembershipState,
        config: MembershipConfig,
        transport: Arc<dyn ClusterTransport>,
        registry: Arc<AgentRegistry>,
        bus: EventBus,
        view_tx: watch::Sender<Arc<MembershipView>>,
        event_tx: broadcast::Sender<MembershipEvent>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            state,
            config,
            transport,
            registry,
            bus,
            view_tx,
            event_tx,
            commands,
            rng: StdRng::from_entropy(),
            probing: false,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(local = %self.state.local(), "membership task started");

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    None | Some(Command::Stop) => break,
                    Some(command) => self.handle(command).await,
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        info!(local = %self.state.local(), "membership task stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Join { seeds, reply } => self.start_join(seeds, reply).await,
            Command::JoinDone {
                attempted,
                acks,
                reply,
            } => {
                let answered = acks.len();
                for ack in acks {
                    self.absorb(ack).await;
                }
                let result = if answered == 0 {
                    warn!(attempted, "no seed answered; running as a singleton");
                    Err(Error::JoinFailed { attempted })
                } else {
                    info!(answered, attempted, "joined cluster");
                    Ok(answered)
                };
                let _ = reply.send(result);
            }
            Command::Inbound { payload, reply } => {
                let first_contact = !self.state.knows(&payload.sender.id);
                let sender = payload.sender.id.clone();
                self.absorb(payload).await;
                let response = if first_contact {
                    self.with_registry(self.state.full_payload()).await
                } else {
                    let payload = self.state.payload_for(Some(&sender));
                    self.with_registry(payload).await
                };
                let _ = reply.send(response);
            }
            Command::Outgoing { target, reply } => {
                let payload = self.state.payload_for(target.as_ref());
                let payload = self.with_registry(payload).await;
                let _ = reply.send(payload);
            }
            Command::Acked { payload } => self.absorb(payload).await,
            Command::ProbeDone { target, ack } => {
                self.probing = false;
                match ack {
                    Some(ack) => self.absorb(ack).await,
                    None => {
                        let event = self.state.probe_failed(&target, Instant::now());
                        self.publish(event.into_iter().collect()).await;
                    }
                }
            }
            Command::Leave { reply } => {
                self.state.leave();
                self.publish(Vec::new()).await;
                let fanout = self.config.indirect_probes.max(1);
                let targets = self.state.random_alive(fanout, &mut self.rng);
                let mut outgoing = Vec::with_capacity(targets.len());
                for target in targets {
                    let payload = self.state.payload_for(Some(&target.id));
                    outgoing.push((target.addr, payload));
                }
                info!(local = %self.state.local(), "left cluster");
                let _ = reply.send(outgoing);
            }
            Command::Stop => {}
        }
    }

    async fn on_tick(&mut self) {
        if self.state.has_left() {
            return;
        }
        let events = self.state.expire(Instant::now());
        self.publish(events).await;
        self.state.start_round();

        if !self.probing {
            if let Some(target) = self.state.next_probe_target(&mut self.rng) {
                self.spawn_probe(target).await;
            }
        }
        if let Some(dead) = self.state.reconnect_target(&mut self.rng) {
            self.spawn_reconnect(dead).await;
        }
    }

    async fn spawn_probe(&mut self, target: ProcessIdentity) {
        self.probing = true;
        let payload = self.state.payload_for(Some(&target.id));
        let payload = self.with_registry(payload).await;
        let relays: Vec<SocketAddr> = self
            .state
            .relays(&target.id, &mut self.rng)
            .into_iter()
            .map(|r| r.addr)
            .collect();
        let transport = Arc::clone(&self.transport);
        let commands = self.commands.clone();
        let probe_timeout = self.config.probe_timeout();
        let indirect_timeout = self.config.indirect_timeout();

        tokio::spawn(async move {
            let ack = probe(
                transport.as_ref(),
                &target,
                payload,
                relays,
                probe_timeout,
                indirect_timeout,
            )
            .await;
            let _ = commands
                .send(Command::ProbeDone {
                    target: target.id,
                    ack,
                })
                .await;
        });
    }

    async fn spawn_reconnect(&mut self, target: ProcessIdentity) {
        debug!(target = %target, "reconnect ping to dead member");
        let payload = self.state.payload_for(Some(&target.id));
        let payload = self.with_registry(payload).await;
        let transport = Arc::clone(&self.transport);
        let commands = self.commands.clone();
        let probe_timeout = self.config.probe_timeout();

        tokio::spawn(async move {
            if let Ok(Ok(ack)) = timeout(probe_timeout, transport.ping(target.addr, payload)).await
            {
                let _ = commands.send(Command::Acked { payload: ack }).await;
            }
        });
    }

    async fn start_join(&mut self, seeds: Vec<SocketAddr>, reply: oneshot::Sender<Result<usize>>) {
        let local_addr = self.state.local().addr;
        let seeds: Vec<SocketAddr> = seeds.into_iter().filter(|s| *s != local_addr).collect();
        if seeds.is_empty() {
            info!("no seeds; bootstrapping a singleton cluster");
            let _ = reply.send(Ok(0));
            return;
        }

        let payload = self.with_registry(self.state.full_payload()).await;
        let transport = Arc::clone(&self.transport);
        let commands = self.commands.clone();
        let join_timeout = self.config.indirect_timeout();
        let attempted = seeds.len();

        tokio::spawn(async move {
            let pings = seeds.into_iter().map(|seed| {
                let transport = Arc::clone(&transport);
                let payload = payload.clone();
                async move {
                    match timeout(join_timeout, transport.ping(seed, payload)).await {
                        Ok(Ok(ack)) => Some(ack),
                        Ok(Err(e)) => {
                            debug!(seed = %seed, error = %e, "seed did not answer");
                            None
                        }
                        Err(_) => {
                            debug!(seed = %seed, "seed timed out");
                            None
                        }
                    }
                }
            });
            let acks: Vec<GossipPayload> = join_all(pings).await.into_iter().flatten().collect();
            let _ = commands
                .send(Command::JoinDone {
                    attempted,
                    acks,
                    reply,
                })
                .await;
        });
    }

    /// Apply a payload's membership and registry contents, then publish.
    async fn absorb(&mut self, payload: GossipPayload) {
        let events = self.state.apply_payload(&payload, Instant::now());
        self.registry.merge(payload.registry).await;
        self.publish(events).await;
    }

    async fn with_registry(&self, mut payload: GossipPayload) -> GossipPayload {
        payload.registry = self
            .registry
            .gossip_batch(self.config.max_registry_deltas, self.state.retransmit_limit())
            .await;
        payload
    }

    async fn publish(&mut self, events: Vec<MembershipEvent>) {
        let view = self.state.view().clone();
        self.view_tx.send_if_modified(|current| {
            if **current == view {
                false
            } else {
                *current = Arc::new(view);
                true
            }
        });

        for event in events {
            info!(event = %event, "membership changed");
            let identity = event.identity();
            let incarnation = self
                .state
                .view()
                .member(&identity.id)
                .map_or(0, |m| m.incarnation);
            self.bus
                .emit(ObservabilityEvent::membership(
                    &identity.id,
                    event.status(),
                    incarnation,
                ))
                .await;
            let _ = self.event_tx.send(event);
        }
    }
}

/// Direct probe, then indirect probes through relays.
async fn probe(
    transport: &dyn ClusterTransport,
    target: &ProcessIdentity,
    payload: GossipPayload,
    relays: Vec<SocketAddr>,
    probe_timeout: Duration,
    indirect_timeout: Duration,
) -> Option<GossipPayload> {
    match timeout(probe_timeout, transport.ping(target.addr, payload.clone())).await {
        Ok(Ok(ack)) => return Some(ack),
        Ok(Err(e)) => debug!(target = %target, error = %e, "direct probe failed"),
        Err(_) => debug!(target = %target, "direct probe timed out"),
    }
    if relays.is_empty() {
        return None;
    }

    let attempts = relays.into_iter().map(|relay| {
        let payload = payload.clone();
        let target = target.clone();
        Box::pin(async move { transport.ping_req(relay, target, payload).await })
    });
    match timeout(indirect_timeout, select_ok(attempts)).await {
        Ok(Ok((ack, _))) => Some(ack),
        Ok(Err(e)) => {
            debug!(target = %target, error = %e, "indirect probes failed");
            None
        }
        Err(_) => {
            debug!(target = %target, "indirect probes timed out");
            None
        }
    }
}
