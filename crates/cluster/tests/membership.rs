//! Multi-process membership, registry gossip and partition healing over an
//! in-process mesh.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use murmur_cluster::{
    AgentRegistry, AntiEntropyRequest, AntiEntropyResponse, ClusterTransport, GossipPayload,
    Membership, MembershipEvent, PartitionManager, WriteMode, WriteOutcome, anti_entropy,
};
use murmur_core::{AgentId, Error, NodeConfig, PartitionState, ProcessIdentity, Result};
use murmur_events::EventBus;

#[derive(Default)]
struct Mesh {
    nodes: Mutex<HashMap<SocketAddr, (Membership, Arc<AgentRegistry>)>>,
    isolated: Mutex<HashSet<SocketAddr>>,
}

impl Mesh {
    fn route(&self, from: SocketAddr, to: SocketAddr) -> Result<(Membership, Arc<AgentRegistry>)> {
        let isolated = self.isolated.lock().unwrap();
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(Error::transport(to, "link cut"));
        }
        drop(isolated);
        self.nodes
            .lock()
            .unwrap()
            .get(&to)
            .cloned()
            .ok_or_else(|| Error::transport(to, "connection refused"))
    }

    fn isolate(&self, addr: SocketAddr) {
        self.isolated.lock().unwrap().insert(addr);
    }

    fn heal(&self) {
        self.isolated.lock().unwrap().clear();
    }
}

struct Link {
    from: SocketAddr,
    mesh: Arc<Mesh>,
}

#[async_trait]
impl ClusterTransport for Link {
    async fn ping(&self, target: SocketAddr, payload: GossipPayload) -> Result<GossipPayload> {
        let (membership, _) = self.mesh.route(self.from, target)?;
        membership.handle_ping(payload).await
    }

    async fn ping_req(
        &self,
        relay: SocketAddr,
        target: ProcessIdentity,
        payload: GossipPayload,
    ) -> Result<GossipPayload> {
        let (membership, _) = self.mesh.route(self.from, relay)?;
        membership.handle_ping_req(target, payload).await
    }

    async fn anti_entropy(
        &self,
        target: SocketAddr,
        request: AntiEntropyRequest,
    ) -> Result<AntiEntropyResponse> {
        let (_, registry) = self.mesh.route(self.from, target)?;
        Ok(anti_entropy::answer(&registry, request).await)
    }
}

struct TestNode {
    identity: ProcessIdentity,
    membership: Membership,
    registry: Arc<AgentRegistry>,
    partition: PartitionManager,
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn spawn_node(mesh: &Arc<Mesh>, name: &str, port: u16, quorum: usize) -> TestNode {
    let mut config = NodeConfig::for_testing();
    config.partition.quorum = quorum;
    let identity = ProcessIdentity::new(name, addr(port));
    let transport: Arc<dyn ClusterTransport> = Arc::new(Link {
        from: identity.addr,
        mesh: Arc::clone(mesh),
    });
    let registry = Arc::new(AgentRegistry::new(identity.clone(), config.registry.clone()));
    let bus = EventBus::in_memory();
    let membership = Membership::start(
        identity.clone(),
        0,
        config.membership.clone(),
        Arc::clone(&transport),
        Arc::clone(&registry),
        bus.clone(),
    );
    let partition = PartitionManager::start(
        &membership,
        Arc::clone(&registry),
        transport,
        bus,
        &config.partition,
        config.delivery.ack_timeout(),
    );
    mesh.nodes
        .lock()
        .unwrap()
        .insert(identity.addr, (membership.clone(), Arc::clone(&registry)));
    TestNode {
        identity,
        membership,
        registry,
        partition,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn three_node_cluster(mesh: &Arc<Mesh>, quorum: usize) -> Vec<TestNode> {
    let nodes = vec![
        spawn_node(mesh, "p1", 9001, quorum),
        spawn_node(mesh, "p2", 9002, quorum),
        spawn_node(mesh, "p3", 9003, quorum),
    ];
    assert_eq!(nodes[0].membership.join(vec![]).await.unwrap(), 0);
    nodes[1].membership.join(vec![addr(9001)]).await.unwrap();
    nodes[2].membership.join(vec![addr(9001)]).await.unwrap();

    eventually("all three see each other", || {
        let counts: Vec<usize> = nodes
            .iter()
            .map(|n| n.membership.alive_processes().len())
            .collect();
        async move { counts.iter().all(|c| *c == 3) }
    })
    .await;
    nodes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nodes_converge_after_joining_one_seed() {
    let mesh = Arc::new(Mesh::default());
    let nodes = three_node_cluster(&mesh, 2).await;

    for node in &nodes {
        for other in &nodes {
            assert!(node.membership.is_alive(&other.identity.id));
        }
        assert_eq!(node.partition.state(), PartitionState::Majority);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_with_unreachable_seeds_fails_but_keeps_running() {
    let mesh = Arc::new(Mesh::default());
    let node = spawn_node(&mesh, "lonely", 9101, 1);

    let err = node.membership.join(vec![addr(9199)]).await.unwrap_err();
    assert!(matches!(err, Error::JoinFailed { attempted: 1 }));
    assert!(node.membership.is_alive(&node.identity.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_member_is_failed_then_recovers() {
    let mesh = Arc::new(Mesh::default());
    let nodes = three_node_cluster(&mesh, 2).await;
    let mut events = nodes[0].membership.subscribe();

    mesh.isolate(nodes[2].identity.addr);
    eventually("p1 declares p3 dead", || {
        let alive = nodes[0].membership.is_alive(&nodes[2].identity.id);
        async move { !alive }
    })
    .await;

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if matches!(&event, MembershipEvent::Failed(id) if id.id == nodes[2].identity.id) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);

    mesh.heal();
    eventually("p1 sees p3 again", || {
        let alive = nodes[0].membership.is_alive(&nodes[2].identity.id);
        async move { alive }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registrations_spread_by_gossip() {
    let mesh = Arc::new(Mesh::default());
    let nodes = three_node_cluster(&mesh, 2).await;

    let outcome = nodes[0]
        .registry
        .register(
            AgentId::new("planner"),
            BTreeSet::from(["plan".to_string()]),
            BTreeMap::new(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Applied(_)));

    let registry = Arc::clone(&nodes[2].registry);
    eventually("p3 resolves planner", || {
        let registry = Arc::clone(&registry);
        async move { registry.resolve(&AgentId::new("planner")).await.is_some() }
    })
    .await;
    assert_eq!(
        nodes[2].registry.resolve(&AgentId::new("planner")).await,
        Some(nodes[0].identity.clone())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_writes_queue_and_replay_on_heal() {
    let mesh = Arc::new(Mesh::default());
    let nodes = three_node_cluster(&mesh, 2).await;

    mesh.isolate(nodes[2].identity.addr);
    eventually("p3 classifies itself isolated", || {
        let current = nodes[2].partition.state();
        async move { current == PartitionState::Isolated }
    })
    .await;
    assert_eq!(nodes[2].registry.write_mode().await, WriteMode::Queued);

    let outcome = nodes[2]
        .registry
        .register(AgentId::new("scout"), BTreeSet::new(), BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Queued);
    assert_eq!(nodes[2].registry.pending_writes().await, 1);

    mesh.heal();
    eventually("p3 is back in the majority", || {
        let current = nodes[2].partition.state();
        async move { current == PartitionState::Majority }
    })
    .await;
    assert_eq!(nodes[2].registry.pending_writes().await, 0);

    let registry = Arc::clone(&nodes[0].registry);
    eventually("p1 resolves scout", || {
        let registry = Arc::clone(&registry);
        async move { registry.resolve(&AgentId::new("scout")).await.is_some() }
    })
    .await;
}
