//! A murmur process: membership, registry, partition manager, router and
//! supervisor wired together, plus the background upkeep they need.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use murmur_cluster::{
    AgentRegistry, ClusterTransport, FileStateStore, InMemoryStateStore, Membership,
    MembershipView, NodeSnapshot, PartitionManager, StateStore, WriteOutcome, anti_entropy,
};
use murmur_core::{
    AgentId, MessageId, NodeConfig, PartitionState, ProcessId, ProcessIdentity, Result, ResultExt,
};
use murmur_events::{EventBus, InMemoryEventStore, TracingEventStore};
use murmur_router::{
    DeliveryStatus, Envelope, LocalAgent, MessageRouter, NodeId, RemoteTransport,
    RestartStrategy, RouterConfig, Supervised, SupervisorHandle, SupervisorTree,
};

use crate::net::{Frame, FrameHandler, Reply};

/// Pick the snapshot store named by the configuration.
#[must_use]
pub fn store_for(config: &NodeConfig) -> Arc<dyn StateStore> {
    match &config.store.path {
        Some(path) => Arc::new(FileStateStore::new(path.clone())),
        None => Arc::new(InMemoryStateStore::new()),
    }
}

/// Event bus that logs every event and keeps a bounded history.
#[must_use]
pub fn default_bus() -> EventBus {
    EventBus::new(Arc::new(TracingEventStore::new(InMemoryEventStore::new())))
}

pub struct Node {
    identity: ProcessIdentity,
    config: NodeConfig,
    bus: EventBus,
    registry: Arc<AgentRegistry>,
    membership: Membership,
    partition: PartitionManager,
    router: Arc<MessageRouter>,
    supervisor: SupervisorHandle,
    store: Arc<dyn StateStore>,
    cluster: Arc<dyn ClusterTransport>,
    known_peers: Vec<SocketAddr>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start every component. A snapshot left by an earlier run of the same
    /// process id restores the registry and resumes above its incarnation.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an invalid configuration, `Error::Storage` if an
    /// existing snapshot cannot be read.
    pub async fn start<T>(
        config: NodeConfig,
        transport: Arc<T>,
        store: Arc<dyn StateStore>,
        bus: EventBus,
    ) -> Result<Arc<Self>>
    where
        T: ClusterTransport + RemoteTransport,
    {
        config.validate()?;
        let id = config
            .id
            .clone()
            .map_or_else(ProcessId::generate, ProcessId::new);
        let identity = ProcessIdentity::new(id, config.listen);

        let registry = Arc::new(AgentRegistry::new(identity.clone(), config.registry.clone()));
        let (incarnation, known_peers) = match store.load().await? {
            Some(snapshot) if snapshot.process.id == identity.id => {
                let restored = registry.restore(snapshot.registry).await;
                info!(
                    process = %identity,
                    restored,
                    previous_incarnation = snapshot.incarnation,
                    "restored snapshot"
                );
                (snapshot.incarnation.saturating_add(1), snapshot.peers)
            }
            Some(snapshot) => {
                warn!(
                    found = %snapshot.process,
                    expected = %identity.id,
                    "ignoring snapshot of another process"
                );
                (0, Vec::new())
            }
            None => (0, Vec::new()),
        };

        let cluster: Arc<dyn ClusterTransport> = transport.clone();
        let remote: Arc<dyn RemoteTransport> = transport;

        let membership = Membership::start(
            identity.clone(),
            incarnation,
            config.membership.clone(),
            Arc::clone(&cluster),
            Arc::clone(&registry),
            bus.clone(),
        );
        let partition = PartitionManager::start(
            &membership,
            Arc::clone(&registry),
            Arc::clone(&cluster),
            bus.clone(),
            &config.partition,
            config.delivery.ack_timeout(),
        );
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            membership.watch(),
            partition.subscribe(),
            remote,
            bus.clone(),
            RouterConfig::from(&config),
        ));
        let (supervisor, supervisor_task) = SupervisorHandle::spawn(SupervisorTree::new(
            format!("{}-root", identity.id),
            RestartStrategy::OneForOne,
            config.supervisor.clone(),
            bus.clone(),
        ));

        let node = Arc::new(Self {
            identity,
            config,
            bus,
            registry,
            membership,
            partition,
            router,
            supervisor,
            store,
            cluster,
            known_peers,
            tasks: Mutex::new(Vec::new()),
        });
        let tasks = vec![
            supervisor_task,
            node.router.spawn_requeue(),
            Self::spawn_maintenance(&node),
            Self::spawn_snapshots(&node),
        ];
        node.tasks.lock().await.extend(tasks);
        info!(process = %node.identity, incarnation, "node started");
        Ok(node)
    }

    /// Join through `seeds`, or through the peers remembered from the last
    /// snapshot when none are given, then reconcile the registry with every
    /// reachable peer.
    ///
    /// # Errors
    ///
    /// `Error::JoinFailed` if seeds were given and none answered.
    pub async fn join(&self, seeds: Vec<SocketAddr>) -> Result<usize> {
        let seeds = if seeds.is_empty() {
            self.known_peers.clone()
        } else {
            seeds
        };
        let answered = self.membership.join(seeds).await?;
        self.reconcile().await;
        Ok(answered)
    }

    /// Host an agent here.
    ///
    /// # Errors
    ///
    /// Propagates registry write errors.
    pub async fn register(
        &self,
        agent_id: impl Into<AgentId>,
        capabilities: BTreeSet<String>,
        metadata: BTreeMap<String, String>,
        agent: Arc<dyn LocalAgent>,
    ) -> Result<WriteOutcome> {
        self.router
            .attach(agent_id.into(), capabilities, metadata, agent)
            .await
    }

    /// Stop hosting an agent.
    ///
    /// # Errors
    ///
    /// `Error::AgentNotRegistered` if it is not registered.
    pub async fn deregister(&self, agent_id: &AgentId) -> Result<WriteOutcome> {
        self.router.detach(agent_id).await
    }

    pub async fn route(&self, envelope: Envelope) -> DeliveryStatus {
        self.router.route(envelope).await
    }

    pub async fn cancel(&self, message_id: &MessageId) -> bool {
        self.router.cancel(message_id).await
    }

    /// Start `entity` under the root supervisor.
    ///
    /// # Errors
    ///
    /// `Error::StartFailed` if it does not start.
    pub async fn supervise(&self, entity: Box<dyn Supervised>) -> Result<NodeId> {
        self.supervisor
            .add_worker(self.supervisor.root(), entity)
            .await
    }

    /// Persist the current state now.
    ///
    /// # Errors
    ///
    /// `Error::Storage` if the store rejects the snapshot.
    pub async fn save_snapshot(&self) -> Result<()> {
        let view = self.membership.snapshot();
        let snapshot = NodeSnapshot::new(
            self.identity.clone(),
            view.incarnation,
            self.registry.all_entries().await,
            view.alive_peers().into_iter().map(|p| p.addr).collect(),
        );
        self.store.save(&snapshot).await
    }

    /// Leave the cluster gracefully: snapshot, announce departure, then stop
    /// supervised entities and background tasks.
    ///
    /// # Errors
    ///
    /// Fails only if the membership task already stopped.
    pub async fn leave(&self) -> Result<()> {
        info!(process = %self.identity, "leaving cluster");
        self.save_snapshot()
            .await
            .into_option_logged("final snapshot");
        let left = self.membership.leave().await;
        self.shutdown().await;
        left
    }

    /// Stop without telling anyone, as a crash would.
    pub async fn shutdown(&self) {
        self.membership.stop().await;
        self.partition.stop();
        self.supervisor.shutdown().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        debug!(process = %self.identity, "node stopped");
    }

    #[must_use]
    pub const fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn membership(&self) -> &Membership {
        &self.membership
    }

    #[must_use]
    pub const fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    #[must_use]
    pub const fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    #[must_use]
    pub fn view(&self) -> Arc<MembershipView> {
        self.membership.snapshot()
    }

    #[must_use]
    pub fn partition_state(&self) -> PartitionState {
        self.partition.state()
    }

    async fn reconcile(&self) {
        let limit = self.config.delivery.ack_timeout();
        let peers = self.membership.snapshot().alive_peers();
        let exchanges = peers.iter().map(|peer| {
            anti_entropy::exchange(&self.registry, self.cluster.as_ref(), peer, limit)
        });
        let merged: usize = join_all(exchanges)
            .await
            .into_iter()
            .zip(&peers)
            .filter_map(|(result, peer)| {
                result.into_option_logged(&format!("anti-entropy with {peer}"))
            })
            .sum();
        debug!(peers = peers.len(), merged, "registry reconciled");
    }

    fn spawn_maintenance(node: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            let mut ticker = interval(node.config.store.maintenance_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.registry.gc_tombstones(Utc::now()).await;
                node.router.maintain(Instant::now()).await;
            }
        })
    }

    fn spawn_snapshots(node: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            let mut ticker = interval(node.config.store.snapshot_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                node.save_snapshot()
                    .await
                    .into_option_logged("periodic snapshot");
            }
        })
    }
}

#[async_trait]
impl FrameHandler for Node {
    async fn handle(&self, frame: Frame) -> Reply {
        match frame {
            Frame::Ping { payload } => match self.membership.handle_ping(payload).await {
                Ok(payload) => Reply::Ack { payload },
                Err(e) => Reply::Error {
                    reason: e.to_string(),
                },
            },
            Frame::PingReq { target, payload } => {
                match self.membership.handle_ping_req(target, payload).await {
                    Ok(payload) => Reply::Ack { payload },
                    Err(e) => Reply::Error {
                        reason: e.to_string(),
                    },
                }
            }
            Frame::AntiEntropy { request } => Reply::AntiEntropy {
                response: anti_entropy::answer(&self.registry, request).await,
            },
            Frame::Forward { envelope } => Reply::Forward {
                outcome: self.router.handle_inbound(envelope).await,
            },
            Frame::Locate { agent_id } => Reply::Located {
                entry: self.router.handle_locate(&agent_id).await,
            },
        }
    }
}
