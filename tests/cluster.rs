//! Whole nodes talking over the loopback network and over TCP.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};

use murmur::murmur_cluster::{FileStateStore, InMemoryStateStore, StateStore, WriteOutcome};
use murmur::murmur_core::{
    AgentId, DeliveryGuarantee, NodeConfig, PartitionState, ProcessId, Result,
};
use murmur::murmur_events::EventBus;
use murmur::murmur_router::{
    DeliveryStatus, Envelope, MailboxAgent, Performative, RestartStrategy, Supervised,
};
use murmur::{FrameHandler, LoopbackNetwork, Node, TcpTransport, serve};

fn loopback_addr(index: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, index], 7946))
}

fn config(index: u8, quorum: usize) -> NodeConfig {
    let mut config = NodeConfig::for_testing();
    config.id = Some(format!("n{index}"));
    config.listen = loopback_addr(index);
    config.partition.quorum = quorum;
    config
}

async fn start_on(
    network: &Arc<LoopbackNetwork>,
    config: NodeConfig,
    store: Arc<dyn StateStore>,
) -> Arc<Node> {
    let addr = config.listen;
    let node = Node::start(config, network.transport(addr), store, EventBus::in_memory())
        .await
        .unwrap();
    let handler: Arc<dyn FrameHandler> = node.clone();
    network.attach(addr, &handler);
    node
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

async fn cluster(network: &Arc<LoopbackNetwork>, configs: Vec<NodeConfig>) -> Vec<Arc<Node>> {
    let mut nodes = Vec::new();
    for config in configs {
        nodes.push(start_on(network, config, Arc::new(InMemoryStateStore::new())).await);
    }
    let seed = nodes[0].identity().addr;
    for node in &nodes[1..] {
        node.join(vec![seed]).await.unwrap();
    }
    let size = nodes.len();
    eventually("every node sees the whole cluster", || {
        let converged = nodes.iter().all(|n| n.view().alive_count() == size);
        async move { converged }
    })
    .await;
    nodes
}

async fn host(node: &Node, agent: &str) -> mpsc::Receiver<Envelope> {
    let (mailbox, inbox) = MailboxAgent::channel(64);
    let outcome = node
        .register(agent, BTreeSet::new(), BTreeMap::new(), Arc::new(mailbox))
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Applied(_)));
    inbox
}

async fn wait_until_known(node: &Arc<Node>, agent: &str) {
    let registry = Arc::clone(node.registry());
    let agent = AgentId::new(agent);
    eventually("registration gossiped", || {
        let registry = Arc::clone(&registry);
        let agent = agent.clone();
        async move { registry.resolve(&agent).await.is_some() }
    })
    .await;
}

fn message(sequence: u64, guarantee: DeliveryGuarantee) -> Envelope {
    Envelope::new(
        "alice",
        "bob",
        "plan-42",
        sequence,
        Performative::Inform,
        json!({"step": sequence}),
    )
    .with_guarantee(guarantee)
}

async fn receive(inbox: &mut mpsc::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(10), inbox.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_once_messages_arrive_in_order_across_nodes() {
    let network = LoopbackNetwork::new();
    let nodes = cluster(&network, vec![config(1, 1), config(2, 1)]).await;
    let mut inbox = host(&nodes[1], "bob").await;
    wait_until_known(&nodes[0], "bob").await;

    for sequence in 0..3 {
        let status = nodes[0]
            .route(message(sequence, DeliveryGuarantee::ExactlyOnce))
            .await;
        assert_eq!(status, DeliveryStatus::Delivered);
    }

    for expected in 0..3 {
        assert_eq!(receive(&mut inbox).await.sequence, expected);
    }
    assert!(inbox.try_recv().is_err());
    assert_eq!(
        nodes[1]
            .router()
            .participants(&"plan-42".into())
            .await
            .len(),
        2
    );

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_holds_messages_until_the_partition_heals() {
    let network = LoopbackNetwork::new();
    let configs = (1..=5)
        .map(|i| {
            let mut config = config(i, 3);
            config.delivery.max_attempts = 50;
            config.delivery.max_backoff_ms = 100;
            config
        })
        .collect();
    let nodes = cluster(&network, configs).await;
    let mut inbox = host(&nodes[3], "bob").await;
    wait_until_known(&nodes[0], "bob").await;

    let minority: Vec<SocketAddr> = nodes[..2].iter().map(|n| n.identity().addr).collect();
    let majority: Vec<SocketAddr> = nodes[2..].iter().map(|n| n.identity().addr).collect();
    network.partition(&minority, &majority);

    eventually("the two-node side sees itself in the minority", || {
        let state = nodes[0].partition_state();
        async move { state == PartitionState::Minority }
    })
    .await;
    eventually("the three-node side keeps its majority", || {
        let state = nodes[2].partition_state();
        async move { state == PartitionState::Majority }
    })
    .await;

    let status = nodes[0]
        .route(message(0, DeliveryGuarantee::AtLeastOnce))
        .await;
    assert_eq!(status, DeliveryStatus::Queued);
    assert_eq!(nodes[0].router().held_count().await, 1);

    network.heal();
    let envelope = receive(&mut inbox).await;
    assert_eq!(envelope.sequence, 0);
    assert_eq!(envelope.sender, AgentId::new("alice"));
    assert_eq!(nodes[0].router().held_count().await, 0);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_converge_on_one_host() {
    let network = LoopbackNetwork::new();
    let nodes = cluster(&network, vec![config(1, 2), config(2, 2), config(3, 2)]).await;

    let (first, second) = tokio::join!(host(&nodes[0], "scheduler"), host(&nodes[2], "scheduler"));
    drop((first, second));

    let agent = AgentId::new("scheduler");
    let registries: Vec<_> = nodes.iter().map(|n| Arc::clone(n.registry())).collect();
    eventually("every registry agrees on the host", || {
        let registries = registries.clone();
        let agent = agent.clone();
        async move {
            let mut hosts = Vec::new();
            for registry in &registries {
                hosts.push(registry.resolve(&agent).await);
            }
            hosts[0].is_some() && hosts.iter().all(|h| *h == hosts[0])
        }
    })
    .await;

    let host = nodes[1].registry().resolve(&agent).await.unwrap();
    assert!(host.id == nodes[0].identity().id || host.id == nodes[2].identity().id);

    for node in &nodes {
        node.shutdown().await;
    }
}

type Log = Arc<Mutex<Vec<String>>>;

struct Stage {
    name: String,
    log: Log,
}

impl Stage {
    fn boxed(name: &str, log: &Log) -> Box<dyn Supervised> {
        Box::new(Self {
            name: name.to_string(),
            log: Arc::clone(log),
        })
    }
}

#[async_trait]
impl Supervised for Stage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        self.log.lock().unwrap().push(format!("start {}", self.name));
        Ok(())
    }

    async fn stop(&mut self) {
        self.log.lock().unwrap().push(format!("stop {}", self.name));
    }
}

#[tokio::test]
async fn rest_for_one_pipeline_restarts_downstream_stages() {
    let network = LoopbackNetwork::new();
    let node = start_on(&network, config(1, 1), Arc::new(InMemoryStateStore::new())).await;
    let supervisor = node.supervisor();
    let log: Log = Arc::default();

    let pipeline = supervisor
        .add_supervisor(supervisor.root(), "pipeline", RestartStrategy::RestForOne)
        .await
        .unwrap();
    let mut stages = Vec::new();
    for name in ["ingest", "plan", "act"] {
        stages.push(supervisor.add_worker(pipeline, Stage::boxed(name, &log)).await.unwrap());
    }
    log.lock().unwrap().clear();

    let report = supervisor.report_failure(stages[1], "plan crashed").await.unwrap();

    assert_eq!(report.restarted, vec!["plan", "act"]);
    assert_eq!(report.escalations, 0);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["stop plan", "stop act", "start plan", "start act"]
    );
    let ingest = supervisor.status(stages[0]).await.unwrap();
    assert!(ingest.running);
    assert_eq!(ingest.restart_count, 0);
    assert_eq!(supervisor.status(stages[1]).await.unwrap().restart_count, 1);
    assert_eq!(supervisor.find("act").await, Some(stages[2]));

    node.shutdown().await;
}

#[tokio::test]
async fn restart_restores_registry_and_bumps_incarnation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("n1.snapshot");
    let network = LoopbackNetwork::new();

    let first = start_on(&network, config(1, 1), Arc::new(FileStateStore::new(&path))).await;
    let _inbox = host(&first, "bob").await;
    first.save_snapshot().await.unwrap();
    first.shutdown().await;
    network.detach(first.identity().addr);

    let restarted = start_on(&network, config(1, 1), Arc::new(FileStateStore::new(&path))).await;

    assert_eq!(restarted.identity().id, ProcessId::new("n1"));
    assert_eq!(restarted.view().incarnation, 1);
    assert_eq!(
        restarted.registry().resolve(&AgentId::new("bob")).await,
        Some(restarted.identity().clone())
    );
    restarted.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nodes_route_over_tcp() {
    let mut nodes = Vec::new();
    let mut servers = Vec::new();
    for index in 1..=2u8 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = NodeConfig::for_testing();
        config.id = Some(format!("tcp{index}"));
        config.listen = listener.local_addr().unwrap();
        let transport = Arc::new(TcpTransport::new(
            Duration::from_millis(500),
            Duration::from_secs(1),
        ));
        let node = Node::start(
            config,
            transport,
            Arc::new(InMemoryStateStore::new()),
            EventBus::in_memory(),
        )
        .await
        .unwrap();
        let handler: Arc<dyn FrameHandler> = node.clone();
        let shutdown = Arc::new(Notify::new());
        let server = tokio::spawn(serve(listener, handler, Arc::clone(&shutdown)));
        servers.push((shutdown, server));
        nodes.push(node);
    }

    nodes[1].join(vec![nodes[0].identity().addr]).await.unwrap();
    eventually("both processes see each other", || {
        let converged = nodes.iter().all(|n| n.view().alive_count() == 2);
        async move { converged }
    })
    .await;

    let mut inbox = host(&nodes[1], "bob").await;
    let status = nodes[0]
        .route(message(0, DeliveryGuarantee::AtLeastOnce))
        .await;
    assert_eq!(status, DeliveryStatus::Delivered);
    assert_eq!(receive(&mut inbox).await.sequence, 0);

    for node in &nodes {
        node.shutdown().await;
    }
    for (shutdown, server) in servers {
        shutdown.notify_one();
        server.await.unwrap();
    }
}
