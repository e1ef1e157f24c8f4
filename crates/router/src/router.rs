//! Message routing with per-message delivery guarantees.
//!
//! `route` resolves the destination (local agent, registry lookup, or a
//! `locate` broadcast) and applies the envelope's guarantee:
//!
//! - at-most-once: a single attempt
//! - at-least-once: retries with backoff; receivers dedup by message id
//! - exactly-once: receivers track applied per-sender sequences
//!
//! Every decision is published as a routing event.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, select_ok};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use murmur_cluster::{AgentRegistry, MembershipView, RegistrationEntry, WriteOutcome};
use murmur_core::{
    AgentId, CircuitConfig, ConversationConfig, ConversationId, DeliveryConfig, DeliveryGuarantee,
    Error, MessageId, NodeConfig, PartitionState, ProcessIdentity, Result,
};
use murmur_events::{EventBus, ObservabilityEvent, RouteDecision};

use crate::conversation::{Arrival, ConversationManager, ConversationStats, Expiry};
use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::delivery::{
    DedupCache, DeliveryStatus, FailureReason, InFlightRecord, InFlightStatus, InFlightTable,
    RetryPolicy, SenderSequencer, SequenceTracker,
};
use crate::envelope::Envelope;
use crate::fault::CircuitBreakers;
use crate::remote::{ForwardReply, InboundOutcome, RemoteTransport};

/// An agent hosted in this process.
pub trait LocalAgent: Send + Sync {
    /// Hand over one message. Must not block.
    ///
    /// # Errors
    ///
    /// The reason reported to the sender.
    fn deliver(&self, envelope: Envelope) -> std::result::Result<(), FailureReason>;
}

/// A local agent backed by a bounded channel.
#[derive(Debug, Clone)]
pub struct MailboxAgent {
    mailbox: mpsc::Sender<Envelope>,
}

impl MailboxAgent {
    /// An agent plus the receiving end of its mailbox.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (mailbox, rx) = mpsc::channel(capacity.max(1));
        (Self { mailbox }, rx)
    }
}

impl LocalAgent for MailboxAgent {
    fn deliver(&self, envelope: Envelope) -> std::result::Result<(), FailureReason> {
        self.mailbox.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FailureReason::QueueFull,
            mpsc::error::TrySendError::Closed(_) => FailureReason::AgentNotResponding,
        })
    }
}

/// Router settings, taken from the node configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterConfig {
    pub conversation: ConversationConfig,
    pub delivery: DeliveryConfig,
    pub circuit: CircuitConfig,
}

impl From<&NodeConfig> for RouterConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            conversation: config.conversation.clone(),
            delivery: config.delivery.clone(),
            circuit: config.circuit.clone(),
        }
    }
}

type LocalOutcome = std::result::Result<InboundOutcome, FailureReason>;

struct Dispatched {
    outcome: LocalOutcome,
    /// Released from a buffer but not handed over.
    stranded: Vec<(Envelope, FailureReason)>,
}

pub struct MessageRouter {
    local: ProcessIdentity,
    registry: Arc<AgentRegistry>,
    views: watch::Receiver<Arc<MembershipView>>,
    partition: watch::Receiver<PartitionState>,
    agents: RwLock<HashMap<AgentId, Arc<dyn LocalAgent>>>,
    conversations: Mutex<ConversationManager>,
    dedup: DedupCache,
    sequences: Mutex<SequenceTracker>,
    sequencer: SenderSequencer,
    inflight: InFlightTable,
    held: Mutex<VecDeque<Envelope>>,
    dead_letters: DeadLetterQueue,
    circuits: CircuitBreakers,
    remote: Arc<dyn RemoteTransport>,
    bus: EventBus,
    config: RouterConfig,
    retry: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        registry: Arc<AgentRegistry>,
        views: watch::Receiver<Arc<MembershipView>>,
        partition: watch::Receiver<PartitionState>,
        remote: Arc<dyn RemoteTransport>,
        bus: EventBus,
        config: RouterConfig,
    ) -> Self {
        Self {
            local: registry.local().clone(),
            registry,
            views,
            partition,
            agents: RwLock::new(HashMap::new()),
            conversations: Mutex::new(ConversationManager::new(config.conversation.clone())),
            dedup: DedupCache::from_config(&config.delivery),
            sequences: Mutex::new(SequenceTracker::new()),
            sequencer: SenderSequencer::new(),
            inflight: InFlightTable::new(),
            held: Mutex::new(VecDeque::new()),
            dead_letters: DeadLetterQueue::new(config.delivery.dead_letter_capacity),
            circuits: CircuitBreakers::new(config.circuit.clone(), bus.clone()),
            remote,
            bus,
            retry: RetryPolicy::from_config(&config.delivery),
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    #[must_use]
    pub const fn local(&self) -> &ProcessIdentity {
        &self.local
    }

    /// Host `agent` here and register it cluster-wide.
    ///
    /// # Errors
    ///
    /// Propagates registry write errors; the agent stays attached locally.
    pub async fn attach(
        &self,
        agent_id: AgentId,
        capabilities: BTreeSet<String>,
        metadata: BTreeMap<String, String>,
        agent: Arc<dyn LocalAgent>,
    ) -> Result<WriteOutcome> {
        self.agents.write().await.insert(agent_id.clone(), agent);
        self.registry.register(agent_id, capabilities, metadata).await
    }

    /// Stop hosting `agent_id` and deregister it.
    ///
    /// # Errors
    ///
    /// `Error::AgentNotRegistered` if the registry has no live entry.
    pub async fn detach(&self, agent_id: &AgentId) -> Result<WriteOutcome> {
        self.agents.write().await.remove(agent_id);
        self.registry.deregister(agent_id).await
    }

    pub async fn is_local(&self, agent_id: &AgentId) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    /// Route one envelope to a terminal status.
    pub async fn route(&self, mut envelope: Envelope) -> DeliveryStatus {
        if envelope.delivery_guarantee == DeliveryGuarantee::ExactlyOnce
            && envelope.sender_sequence.is_none()
        {
            envelope.sender_sequence = Some(self.sequencer.next(&envelope.sender).await);
        }
        if let Err(e) = envelope.validate(self.config.delivery.max_content_bytes) {
            return self.fail(&envelope, FailureReason::from_error(&e)).await;
        }

        if self.is_local(&envelope.destination).await {
            return match self.deliver_local(envelope.clone()).await {
                Ok(InboundOutcome::Delivered | InboundOutcome::Duplicate) => {
                    DeliveryStatus::Delivered
                }
                Ok(InboundOutcome::Buffered) => DeliveryStatus::Queued,
                Err(reason) => self.fail(&envelope, reason).await,
            };
        }

        let partition = *self.partition.borrow();
        match partition {
            PartitionState::Isolated => {
                self.fail(&envelope, FailureReason::PartitionDegraded).await
            }
            PartitionState::Minority if envelope.delivery_guarantee.requires_ack() => {
                self.hold(envelope).await
            }
            PartitionState::Majority | PartitionState::Minority => self.forward(envelope).await,
        }
    }

    /// Deliver an envelope forwarded by another router.
    pub async fn handle_inbound(&self, envelope: Envelope) -> ForwardReply {
        if let Err(e) = envelope.validate(self.config.delivery.max_content_bytes) {
            return ForwardReply::Rejected(FailureReason::from_error(&e));
        }
        if !self.is_local(&envelope.destination).await {
            debug!(destination = %envelope.destination, "forwarded message for an agent not hosted here");
            return ForwardReply::Rejected(FailureReason::UnknownDestination);
        }
        match self.deliver_local(envelope).await {
            Ok(outcome) => ForwardReply::Accepted(outcome),
            Err(reason) => ForwardReply::Rejected(reason),
        }
    }

    /// Answer a `locate` query from a peer.
    pub async fn handle_locate(&self, agent_id: &AgentId) -> Option<RegistrationEntry> {
        self.registry
            .entry(agent_id)
            .await
            .filter(|entry| !entry.is_tombstone())
    }

    /// Withdraw an in-flight or held message. `false` if it is unknown or
    /// already finished.
    pub async fn cancel(&self, message_id: &MessageId) -> bool {
        if self.inflight.cancel(message_id).await {
            info!(message_id = %message_id, "in-flight delivery cancelled");
            return true;
        }
        let removed = {
            let mut held = self.held.lock().await;
            held.iter()
                .position(|e| &e.message_id == message_id)
                .and_then(|position| held.remove(position))
        };
        match removed {
            Some(envelope) => {
                info!(message_id = %message_id, "held message cancelled");
                self.record(&envelope, RouteDecision::Cancelled).await;
                true
            }
            None => false,
        }
    }

    /// Re-route every held message in arrival order. Returns how many were
    /// taken off the hold queue; some may be held again.
    pub async fn replay_held(&self) -> usize {
        let held: Vec<Envelope> = self.held.lock().await.drain(..).collect();
        let count = held.len();
        if count > 0 {
            info!(count, "replaying held messages");
        }
        for envelope in held {
            let id = envelope.message_id.clone();
            let status = self.route(envelope).await;
            debug!(message_id = %id, ?status, "held message replayed");
        }
        count
    }

    /// Replay held messages whenever the partition returns to majority.
    #[must_use]
    pub fn spawn_requeue(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let mut partition = self.partition.clone();
        tokio::spawn(async move {
            while partition.changed().await.is_ok() {
                let state = *partition.borrow_and_update();
                if state == PartitionState::Majority {
                    router.replay_held().await;
                }
            }
        })
    }

    /// Periodic upkeep: conversation expiry and dedup cache maintenance.
    pub async fn maintain(&self, now: Instant) -> Expiry {
        let expiry = self.conversations.lock().await.expire_inactive(now);
        self.dedup.upkeep().await;
        if expiry.closed > 0 || expiry.removed > 0 {
            debug!(closed = expiry.closed, removed = expiry.removed, "conversations expired");
        }
        expiry
    }

    pub async fn close_conversation(&self, conversation_id: &ConversationId) -> bool {
        self.conversations
            .lock()
            .await
            .close(conversation_id, Instant::now())
    }

    pub async fn conversation_stats(&self) -> ConversationStats {
        self.conversations.lock().await.stats()
    }

    pub async fn participants(&self, conversation_id: &ConversationId) -> BTreeSet<AgentId> {
        self.conversations.lock().await.participants(conversation_id)
    }

    #[must_use]
    pub const fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Take a dead letter off the queue and route it again.
    pub async fn retry_dead_letter(&self, message_id: &MessageId) -> Option<DeliveryStatus> {
        let DeadLetter { envelope, .. } = self.dead_letters.take(message_id).await?;
        Some(self.route(envelope).await)
    }

    pub async fn in_flight(&self) -> Vec<InFlightRecord> {
        self.inflight.snapshot().await
    }

    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }

    #[must_use]
    pub const fn circuits(&self) -> &CircuitBreakers {
        &self.circuits
    }

    async fn deliver_local(&self, envelope: Envelope) -> LocalOutcome {
        match envelope.delivery_guarantee {
            DeliveryGuarantee::AtMostOnce => {
                let Dispatched { outcome, stranded } = self.dispatch(envelope).await;
                self.strand(stranded).await;
                outcome
            }
            DeliveryGuarantee::AtLeastOnce => {
                let id = envelope.message_id.clone();
                if !self.dedup.first_seen(&id).await {
                    self.record(&envelope, RouteDecision::Duplicate).await;
                    return Ok(InboundOutcome::Duplicate);
                }
                let Dispatched { outcome, stranded } = self.dispatch(envelope).await;
                if outcome.is_err() {
                    self.dedup.forget(&id).await;
                }
                self.strand(stranded).await;
                outcome
            }
            DeliveryGuarantee::ExactlyOnce => {
                let Some(sequence) = envelope.sender_sequence else {
                    return Err(FailureReason::InvalidMessage);
                };
                let sender = envelope.sender.clone();
                let mut sequences = self.sequences.lock().await;
                if sequences.is_applied(&sender, sequence) {
                    drop(sequences);
                    self.record(&envelope, RouteDecision::Duplicate).await;
                    return Ok(InboundOutcome::Duplicate);
                }
                let Dispatched { outcome, stranded } = self.dispatch(envelope).await;
                if matches!(
                    outcome,
                    Ok(InboundOutcome::Delivered | InboundOutcome::Buffered)
                ) {
                    sequences.record(&sender, sequence);
                }
                drop(sequences);
                self.strand(stranded).await;
                outcome
            }
        }
    }

    /// Pass an envelope through its conversation and hand every released
    /// message to its agent. The outcome is that of `envelope` itself.
    ///
    /// The run stops at the first failed hand-off and the conversation is
    /// rewound to it. If that was a buffered message released by `envelope`
    /// it comes back as stranded.
    async fn dispatch(&self, envelope: Envelope) -> Dispatched {
        let mut decisions = Vec::new();
        let mut stranded = Vec::new();
        let outcome = {
            let mut conversations = self.conversations.lock().await;
            match conversations.accept(envelope.clone(), Instant::now()) {
                Err(e) => Err(FailureReason::from_error(&e)),
                Ok(Arrival::Duplicate) => {
                    decisions.push((envelope.clone(), RouteDecision::Duplicate));
                    Ok(InboundOutcome::Duplicate)
                }
                Ok(Arrival::Buffered) => {
                    decisions.push((envelope.clone(), RouteDecision::Buffered));
                    Ok(InboundOutcome::Buffered)
                }
                Ok(Arrival::Ready(run)) => {
                    let agents = self.agents.read().await;
                    let mut outcome = Ok(InboundOutcome::Delivered);
                    let mut run = run.into_iter();
                    let mut arriving = true;
                    while let Some(ready) = run.next() {
                        let meta = ready.clone();
                        let result = agents
                            .get(&ready.destination)
                            .ok_or(FailureReason::UnknownDestination)
                            .and_then(|agent| agent.deliver(ready));
                        match result {
                            Ok(()) => decisions.push((meta, RouteDecision::DeliveredLocal)),
                            Err(reason) => {
                                warn!(
                                    message_id = %meta.message_id,
                                    destination = %meta.destination,
                                    %reason,
                                    "local delivery failed"
                                );
                                conversations.rewind(&meta, run.by_ref().collect());
                                if arriving {
                                    outcome = Err(reason);
                                } else {
                                    stranded.push((meta, reason));
                                }
                                break;
                            }
                        }
                        arriving = false;
                    }
                    outcome
                }
            }
        };
        for (meta, decision) in decisions {
            self.record(&meta, decision).await;
        }
        Dispatched { outcome, stranded }
    }

    /// A buffered message was acknowledged as queued but could not be handed
    /// over when its turn came. Make it deliverable again and dead-letter it
    /// so it can be retried.
    async fn strand(&self, stranded: Vec<(Envelope, FailureReason)>) {
        for (envelope, reason) in stranded {
            self.dedup.forget(&envelope.message_id).await;
            if let Some(sequence) = envelope.sender_sequence {
                self.sequences.lock().await.forget(&envelope.sender, sequence);
            }
            if envelope.delivery_guarantee.requires_ack() {
                self.dead_letters
                    .push(envelope.clone(), reason.clone(), 1)
                    .await;
                self.record(
                    &envelope,
                    RouteDecision::DeadLettered {
                        reason: reason.to_string(),
                    },
                )
                .await;
            } else {
                self.record(
                    &envelope,
                    RouteDecision::Failed {
                        reason: reason.to_string(),
                    },
                )
                .await;
            }
        }
    }

    async fn hold(&self, envelope: Envelope) -> DeliveryStatus {
        let accepted = {
            let mut held = self.held.lock().await;
            if held.len() >= self.config.delivery.held_capacity {
                false
            } else {
                held.push_back(envelope.clone());
                true
            }
        };
        if !accepted {
            return self.fail(&envelope, FailureReason::QueueFull).await;
        }
        debug!(message_id = %envelope.message_id, "partition degraded, holding message");
        self.record(&envelope, RouteDecision::Held).await;
        DeliveryStatus::Queued
    }

    /// Remote delivery under the envelope's retry policy.
    async fn forward(&self, envelope: Envelope) -> DeliveryStatus {
        let id = envelope.message_id.clone();
        let guarantee = envelope.delivery_guarantee;
        let Some(cancel) = self
            .inflight
            .begin(&id, &envelope.destination, guarantee)
            .await
        else {
            self.record(&envelope, RouteDecision::Duplicate).await;
            return DeliveryStatus::Queued;
        };

        let attempts = self.retry.attempts_for(guarantee);
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            if !self.inflight.update(&id, InFlightStatus::Resolving, None).await {
                return self.cancelled(&envelope).await;
            }
            let partition = *self.partition.borrow();
            if partition == PartitionState::Isolated {
                break FailureReason::PartitionDegraded;
            }
            if partition == PartitionState::Minority && guarantee.requires_ack() {
                self.inflight.finish(&id).await;
                return self.hold(envelope).await;
            }

            let reason = match self.attempt(&envelope).await {
                Ok((process, outcome)) => {
                    self.inflight.finish(&id).await;
                    let decision = match outcome {
                        InboundOutcome::Duplicate => RouteDecision::Duplicate,
                        InboundOutcome::Delivered | InboundOutcome::Buffered => {
                            RouteDecision::Forwarded { process }
                        }
                    };
                    self.record(&envelope, decision).await;
                    return if outcome == InboundOutcome::Buffered {
                        DeliveryStatus::Queued
                    } else {
                        DeliveryStatus::Delivered
                    };
                }
                Err(reason) => reason,
            };
            if !reason.is_retryable() || attempt >= attempts {
                break reason;
            }

            let backoff = {
                let mut rng = self.rng.lock().await;
                self.retry.backoff(attempt, &mut *rng)
            };
            debug!(message_id = %id, attempt, %reason, ?backoff, "delivery attempt failed");
            self.record(
                &envelope,
                RouteDecision::Retrying {
                    attempt,
                    backoff_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                },
            )
            .await;
            if !self.inflight.update(&id, InFlightStatus::Backoff, None).await {
                return self.cancelled(&envelope).await;
            }
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = cancel.notified() => return self.cancelled(&envelope).await,
            }
        };

        if self.inflight.finish(&id).await.is_none() {
            return self.cancelled(&envelope).await;
        }
        if guarantee.requires_ack() {
            warn!(message_id = %id, attempts = attempt, %failure, "delivery exhausted, dead-lettering");
            self.dead_letters
                .push(envelope.clone(), failure.clone(), attempt)
                .await;
            self.record(
                &envelope,
                RouteDecision::DeadLettered {
                    reason: failure.to_string(),
                },
            )
            .await;
            DeliveryStatus::Failed(failure)
        } else {
            self.fail(&envelope, failure).await
        }
    }

    /// One resolve-and-forward attempt.
    async fn attempt(
        &self,
        envelope: &Envelope,
    ) -> std::result::Result<(murmur_core::ProcessId, InboundOutcome), FailureReason> {
        let Some(target) = self.locate(&envelope.destination).await else {
            return Err(FailureReason::UnknownDestination);
        };
        if target.id == self.local.id {
            // Registered here but not attached (yet, or any more).
            return Err(FailureReason::UnknownDestination);
        }
        self.inflight
            .update(
                &envelope.message_id,
                InFlightStatus::Forwarding,
                Some(&target.id),
            )
            .await;

        let ack_timeout = self.config.delivery.ack_timeout();
        let addr = target.addr;
        let remote = Arc::clone(&self.remote);
        let message_id = envelope.message_id.clone();
        let outgoing = envelope.clone();
        let result = self
            .circuits
            .call(&target.id, &envelope.correlation(), async move {
                match tokio::time::timeout(ack_timeout, remote.forward(addr, outgoing)).await
                {
                    Ok(reply) => reply,
                    Err(_) => Err(Error::delivery_timeout(
                        message_id.as_str(),
                        u64::try_from(ack_timeout.as_millis()).unwrap_or(u64::MAX),
                    )),
                }
            })
            .await;
        match result {
            Ok(ForwardReply::Accepted(outcome)) => Ok((target.id, outcome)),
            Ok(ForwardReply::Rejected(reason)) => Err(reason),
            Err(e) => Err(FailureReason::from_error(&e)),
        }
    }

    /// Live host for `agent_id`: the registry first, then a bounded `locate`
    /// broadcast to reachable peers.
    async fn locate(&self, agent_id: &AgentId) -> Option<ProcessIdentity> {
        let view = self.views.borrow().clone();
        if let Some(host) = self.registry.resolve(agent_id).await {
            if view.is_alive(&host.id) {
                return Some(host);
            }
        }
        if *self.partition.borrow() == PartitionState::Isolated {
            return None;
        }

        let peers = view.alive_peers();
        if peers.is_empty() {
            return None;
        }
        let queries: Vec<BoxFuture<'_, Result<RegistrationEntry>>> = peers
            .into_iter()
            .map(|peer| {
                let remote = Arc::clone(&self.remote);
                let agent = agent_id.clone();
                async move {
                    let found: Option<RegistrationEntry> =
                        remote.locate(peer.addr, agent.clone()).await?;
                    found
                        .filter(|entry| !entry.is_tombstone())
                        .ok_or_else(|| Error::unknown_destination(agent.as_str()))
                }
                .boxed()
            })
            .collect();

        let discovery = tokio::time::timeout(
            self.config.delivery.discovery_timeout(),
            select_ok(queries),
        )
        .await;
        let Ok(Ok((entry, _))) = discovery else {
            debug!(agent_id = %agent_id, "discovery found no host");
            return None;
        };
        debug!(agent_id = %agent_id, host = %entry.hosting_process, "discovered agent");
        self.registry.merge(vec![entry]).await;
        self.registry
            .resolve(agent_id)
            .await
            .filter(|host| view.is_alive(&host.id))
    }

    async fn fail(&self, envelope: &Envelope, reason: FailureReason) -> DeliveryStatus {
        debug!(message_id = %envelope.message_id, %reason, "routing failed");
        self.record(
            envelope,
            RouteDecision::Failed {
                reason: reason.to_string(),
            },
        )
        .await;
        DeliveryStatus::Failed(reason)
    }

    async fn cancelled(&self, envelope: &Envelope) -> DeliveryStatus {
        self.inflight.finish(&envelope.message_id).await;
        self.record(envelope, RouteDecision::Cancelled).await;
        DeliveryStatus::Failed(FailureReason::Cancelled)
    }

    async fn record(&self, envelope: &Envelope, decision: RouteDecision) {
        let mut event = ObservabilityEvent::routing(
            &envelope.message_id,
            &envelope.destination,
            envelope.delivery_guarantee,
            decision,
        );
        if let Some(correlation) = &envelope.correlation_id {
            event.correlation_id = correlation.clone();
        }
        self.bus.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use serde_json::json;

    use murmur_core::{DeliveryGuarantee, RegistryConfig};

    use crate::envelope::Performative;

    struct Unreachable;

    #[async_trait]
    impl RemoteTransport for Unreachable {
        async fn forward(&self, target: SocketAddr, _: Envelope) -> Result<ForwardReply> {
            Err(Error::transport(target, "unreachable"))
        }

        async fn locate(&self, target: SocketAddr, _: AgentId) -> Result<Option<RegistrationEntry>> {
            Err(Error::transport(target, "unreachable"))
        }
    }

    fn router(
        state: PartitionState,
    ) -> (MessageRouter, watch::Sender<PartitionState>) {
        let local = ProcessIdentity::new("p1", SocketAddr::from(([127, 0, 0, 1], 9001)));
        let registry = Arc::new(AgentRegistry::new(local.clone(), RegistryConfig::default()));
        let (_views_tx, views) = watch::channel(Arc::new(MembershipView::new(local, 0)));
        let (partition_tx, partition) = watch::channel(state);
        let config = RouterConfig::from(&NodeConfig::for_testing());
        let router = MessageRouter::new(
            registry,
            views,
            partition,
            Arc::new(Unreachable),
            EventBus::in_memory(),
            config,
        );
        (router, partition_tx)
    }

    async fn mailbox(router: &MessageRouter, name: &str) -> mpsc::Receiver<Envelope> {
        let (agent, rx) = MailboxAgent::channel(16);
        router
            .attach(AgentId::new(name), BTreeSet::new(), BTreeMap::new(), Arc::new(agent))
            .await
            .unwrap();
        rx
    }

    fn message(sequence: u64, guarantee: DeliveryGuarantee) -> Envelope {
        Envelope::new("alice", "bob", "conv", sequence, Performative::Inform, json!(sequence))
            .with_guarantee(guarantee)
    }

    #[tokio::test]
    async fn local_delivery_respects_conversation_order() {
        let (router, _) = router(PartitionState::Majority);
        let mut inbox = mailbox(&router, "bob").await;

        assert_eq!(
            router.route(message(1, DeliveryGuarantee::AtLeastOnce)).await,
            DeliveryStatus::Queued
        );
        assert_eq!(
            router.route(message(0, DeliveryGuarantee::AtLeastOnce)).await,
            DeliveryStatus::Delivered
        );
        assert_eq!(inbox.recv().await.unwrap().sequence, 0);
        assert_eq!(inbox.recv().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn at_least_once_duplicates_are_acknowledged_once() {
        let (router, _) = router(PartitionState::Majority);
        let mut inbox = mailbox(&router, "bob").await;
        let envelope = message(0, DeliveryGuarantee::AtLeastOnce);

        assert!(router.route(envelope.clone()).await.is_delivered());
        assert!(router.route(envelope).await.is_delivered());
        assert!(inbox.recv().await.is_some());
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn exactly_once_rejects_reapplied_sequences() {
        let (router, _) = router(PartitionState::Majority);
        let mut inbox = mailbox(&router, "bob").await;
        let first = message(0, DeliveryGuarantee::ExactlyOnce).with_sender_sequence(7);
        let mut replay = message(1, DeliveryGuarantee::ExactlyOnce).with_sender_sequence(7);
        replay.message_id = MessageId::new("other-id");

        assert!(router.route(first).await.is_delivered());
        assert!(router.route(replay).await.is_delivered());
        assert_eq!(inbox.recv().await.unwrap().sequence, 0);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn isolated_process_fails_remote_sends() {
        let (router, _) = router(PartitionState::Isolated);
        let status = router.route(message(0, DeliveryGuarantee::AtMostOnce)).await;
        assert_eq!(status, DeliveryStatus::Failed(FailureReason::PartitionDegraded));
    }

    #[tokio::test]
    async fn minority_holds_then_cancel_removes() {
        let (router, _) = router(PartitionState::Minority);
        let envelope = message(0, DeliveryGuarantee::AtLeastOnce);
        let id = envelope.message_id.clone();

        assert_eq!(router.route(envelope).await, DeliveryStatus::Queued);
        assert_eq!(router.held_count().await, 1);
        assert!(router.cancel(&id).await);
        assert_eq!(router.held_count().await, 0);
        assert!(!router.cancel(&id).await);
    }

    #[tokio::test]
    async fn unknown_destination_is_dead_lettered_after_retries() {
        let (router, _) = router(PartitionState::Majority);
        let envelope = message(0, DeliveryGuarantee::AtLeastOnce);
        let id = envelope.message_id.clone();

        let status = router.route(envelope).await;

        assert_eq!(status, DeliveryStatus::Failed(FailureReason::UnknownDestination));
        let letters = router.dead_letters().list().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].envelope.message_id, id);
        assert_eq!(letters[0].attempts, 4);
        assert!(router.in_flight().await.is_empty());
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        let (router, _) = router(PartitionState::Majority);
        let big = "x".repeat(NodeConfig::for_testing().delivery.max_content_bytes + 1);
        let envelope = Envelope::new("alice", "bob", "conv", 0, Performative::Inform, json!(big));
        assert_eq!(
            router.route(envelope).await,
            DeliveryStatus::Failed(FailureReason::MessageTooLarge)
        );
    }

    #[tokio::test]
    async fn full_mailbox_reports_queue_full() {
        let (router, _) = router(PartitionState::Majority);
        let (agent, _rx) = MailboxAgent::channel(1);
        router
            .attach(AgentId::new("bob"), BTreeSet::new(), BTreeMap::new(), Arc::new(agent))
            .await
            .unwrap();

        assert!(router.route(message(0, DeliveryGuarantee::AtMostOnce)).await.is_delivered());
        assert_eq!(
            router.route(message(1, DeliveryGuarantee::AtMostOnce)).await,
            DeliveryStatus::Failed(FailureReason::QueueFull)
        );
    }

    async fn single_slot_mailbox(router: &MessageRouter) -> mpsc::Receiver<Envelope> {
        let (agent, rx) = MailboxAgent::channel(1);
        router
            .attach(AgentId::new("bob"), BTreeSet::new(), BTreeMap::new(), Arc::new(agent))
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn failed_hand_off_can_be_resent() {
        let (router, _) = router(PartitionState::Majority);
        let mut inbox = single_slot_mailbox(&router).await;

        assert!(router.route(message(0, DeliveryGuarantee::AtLeastOnce)).await.is_delivered());
        let second = message(1, DeliveryGuarantee::AtLeastOnce);
        assert_eq!(
            router.route(second.clone()).await,
            DeliveryStatus::Failed(FailureReason::QueueFull)
        );

        assert_eq!(inbox.recv().await.unwrap().sequence, 0);
        assert_eq!(router.route(second).await, DeliveryStatus::Delivered);
        assert_eq!(inbox.recv().await.unwrap().sequence, 1);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn released_message_that_cannot_be_handed_over_is_dead_lettered() {
        let (router, _) = router(PartitionState::Majority);
        let mut inbox = single_slot_mailbox(&router).await;

        let second = message(1, DeliveryGuarantee::AtLeastOnce);
        assert_eq!(router.route(second.clone()).await, DeliveryStatus::Queued);
        assert_eq!(
            router.route(message(0, DeliveryGuarantee::AtLeastOnce)).await,
            DeliveryStatus::Delivered
        );

        let letters = router.dead_letters.list().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].envelope.message_id, second.message_id);
        assert_eq!(letters[0].reason, FailureReason::QueueFull);

        assert_eq!(inbox.recv().await.unwrap().sequence, 0);
        assert!(inbox.try_recv().is_err());
        assert_eq!(
            router.retry_dead_letter(&second.message_id).await,
            Some(DeliveryStatus::Delivered)
        );
        assert_eq!(inbox.recv().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn exactly_once_resend_after_failed_hand_off_is_not_a_duplicate() {
        let (router, _) = router(PartitionState::Majority);
        let mut inbox = single_slot_mailbox(&router).await;

        assert!(router.route(message(0, DeliveryGuarantee::ExactlyOnce)).await.is_delivered());
        let mut second = message(1, DeliveryGuarantee::ExactlyOnce);
        second.sender_sequence = Some(1);
        assert_eq!(
            router.route(second.clone()).await,
            DeliveryStatus::Failed(FailureReason::QueueFull)
        );

        assert_eq!(inbox.recv().await.unwrap().sequence, 0);
        assert_eq!(router.route(second).await, DeliveryStatus::Delivered);
        assert_eq!(inbox.recv().await.unwrap().sequence, 1);
    }
}
