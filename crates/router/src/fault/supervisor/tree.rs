//! Arena-backed supervisor tree.
//!
//! Nodes live in a `Vec` and refer to each other by [`NodeId`]; children are
//! kept in registration order, which is what `RestForOne` relies on.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info, warn};

use murmur_core::{Error, Result, SupervisorConfig};
use murmur_events::{EventBus, ObservabilityEvent};

use super::strategy::RestartStrategy;

/// Something a supervisor can start, stop, and restart.
#[async_trait]
pub trait Supervised: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Any error counts as a failure of this entity.
    async fn start(&mut self) -> Result<()>;

    /// Stop the entity. Must tolerate being called when already stopped.
    async fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

enum NodeKind {
    Supervisor {
        strategy: RestartStrategy,
        children: Vec<NodeId>,
    },
    Worker {
        entity: Box<dyn Supervised>,
    },
}

struct SupervisionNode {
    name: String,
    kind: NodeKind,
    parent: Option<NodeId>,
    restart_count: u32,
    restarts: VecDeque<Instant>,
    last_failure_at: Option<Instant>,
    running: bool,
}

/// Read-only view of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub name: String,
    pub is_supervisor: bool,
    pub running: bool,
    pub restart_count: u32,
    pub last_failure_at: Option<Instant>,
}

/// What one failure report caused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartReport {
    /// Names of restarted nodes, in start order.
    pub restarted: Vec<String>,
    pub escalations: u32,
}

pub struct SupervisorTree {
    nodes: Vec<SupervisionNode>,
    config: SupervisorConfig,
    bus: EventBus,
}

impl SupervisorTree {
    /// A tree with a running root supervisor.
    #[must_use]
    pub fn new(
        root_name: impl Into<String>,
        strategy: RestartStrategy,
        config: SupervisorConfig,
        bus: EventBus,
    ) -> Self {
        let root = SupervisionNode {
            name: root_name.into(),
            kind: NodeKind::Supervisor {
                strategy,
                children: Vec::new(),
            },
            parent: None,
            restart_count: 0,
            restarts: VecDeque::new(),
            last_failure_at: None,
            running: true,
        };
        Self {
            nodes: vec![root],
            config,
            bus,
        }
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Add a child supervisor under `parent`.
    ///
    /// # Errors
    ///
    /// `Error::EntityNotFound` if `parent` is not a supervisor in this tree.
    pub fn add_supervisor(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        strategy: RestartStrategy,
    ) -> Result<NodeId> {
        self.ensure_supervisor(parent)?;
        let id = self.push_child(
            parent,
            name.into(),
            NodeKind::Supervisor {
                strategy,
                children: Vec::new(),
            },
        );
        self.nodes[id.0].running = true;
        Ok(id)
    }

    /// Start `entity` and add it under `parent`.
    ///
    /// # Errors
    ///
    /// - `Error::EntityNotFound` if `parent` is not a supervisor.
    /// - `Error::StartFailed` if the entity fails to start; it is not added.
    pub async fn add_worker(
        &mut self,
        parent: NodeId,
        mut entity: Box<dyn Supervised>,
    ) -> Result<NodeId> {
        self.ensure_supervisor(parent)?;
        let name = entity.name().to_string();
        if let Err(e) = entity.start().await {
            return Err(Error::StartFailed {
                entity: name,
                reason: e.to_string(),
            });
        }
        let id = self.push_child(parent, name, NodeKind::Worker { entity });
        self.nodes[id.0].running = true;
        info!(entity = %self.nodes[id.0].name, node = %id, "supervised entity started");
        Ok(id)
    }

    /// Handle a failure of `node` according to its supervisor's strategy.
    ///
    /// A child over its restart budget escalates: its supervisor is treated
    /// as failed and restarted, with its whole subtree, under the
    /// grandparent's strategy.
    ///
    /// # Errors
    ///
    /// - `Error::EntityNotFound` for an unknown node.
    /// - `Error::RestartLimitExceeded` when escalation reaches the root. The
    ///   root's children are stopped; the tree itself stays usable.
    pub async fn report_failure(&mut self, node: NodeId, reason: &str) -> Result<RestartReport> {
        self.ensure_exists(node)?;
        let origin = self.nodes[node.0].name.clone();
        warn!(entity = %origin, node = %node, reason, "supervised entity failed");

        let mut report = RestartReport::default();
        let mut failed = node;
        loop {
            let now = Instant::now();
            self.mark_failed(failed, now).await;

            let Some(parent) = self.nodes[failed.0].parent else {
                return Err(self.root_exhausted(&origin).await);
            };

            if !self.within_budget(failed, now) {
                let grandparent = self.nodes[parent.0]
                    .parent
                    .map(|g| self.nodes[g.0].name.clone());
                warn!(
                    failed = %self.nodes[failed.0].name,
                    supervisor = %self.nodes[parent.0].name,
                    "restart budget exhausted, escalating"
                );
                self.bus
                    .emit(ObservabilityEvent::supervisor_escalation(
                        self.nodes[parent.0].name.clone(),
                        self.nodes[failed.0].name.clone(),
                        grandparent,
                    ))
                    .await;
                report.escalations += 1;
                failed = parent;
                continue;
            }

            let entry = &mut self.nodes[failed.0];
            entry.restarts.push_back(now);
            entry.restart_count += 1;

            let (strategy, targets) = match &self.nodes[parent.0].kind {
                NodeKind::Supervisor { strategy, children } => {
                    (*strategy, strategy.select(children, failed))
                }
                NodeKind::Worker { .. } => return Err(self.not_found(parent)),
            };
            let (restarted, start_failure) = self.restart(&targets, failed).await;
            info!(
                supervisor = %self.nodes[parent.0].name,
                failed = %self.nodes[failed.0].name,
                %strategy,
                restarted = ?restarted,
                "restarted children"
            );
            self.bus
                .emit(ObservabilityEvent::supervisor_restart(
                    self.nodes[parent.0].name.clone(),
                    self.nodes[failed.0].name.clone(),
                    strategy.name(),
                    restarted.clone(),
                ))
                .await;
            report.restarted.extend(restarted);

            match start_failure {
                None => return Ok(report),
                Some(next) => {
                    warn!(entity = %self.nodes[next.0].name, "restart failed to start");
                    failed = next;
                }
            }
        }
    }

    /// Stop every entity, deepest and latest first.
    pub async fn stop_all(&mut self) {
        let children = self.children(self.root());
        for child in children.into_iter().rev() {
            self.stop_subtree(child).await;
        }
    }

    #[must_use]
    pub fn status(&self, node: NodeId) -> Option<NodeStatus> {
        self.nodes.get(node.0).map(|n| NodeStatus {
            id: node,
            name: n.name.clone(),
            is_supervisor: matches!(n.kind, NodeKind::Supervisor { .. }),
            running: n.running,
            restart_count: n.restart_count,
            last_failure_at: n.last_failure_at,
        })
    }

    #[must_use]
    pub fn is_running(&self, node: NodeId) -> bool {
        self.nodes.get(node.0).is_some_and(|n| n.running)
    }

    #[must_use]
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        match self.nodes.get(node.0).map(|n| &n.kind) {
            Some(NodeKind::Supervisor { children, .. }) => children.clone(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push_child(&mut self, parent: NodeId, name: String, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(SupervisionNode {
            name,
            kind,
            parent: Some(parent),
            restart_count: 0,
            restarts: VecDeque::new(),
            last_failure_at: None,
            running: false,
        });
        if let NodeKind::Supervisor { children, .. } = &mut self.nodes[parent.0].kind {
            children.push(id);
        }
        id
    }

    fn within_budget(&mut self, node: NodeId, now: Instant) -> bool {
        let window = self.config.restart_window();
        let entry = &mut self.nodes[node.0];
        while entry
            .restarts
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            entry.restarts.pop_front();
        }
        entry.restarts.len() < self.config.max_restarts as usize
    }

    async fn mark_failed(&mut self, node: NodeId, now: Instant) {
        self.nodes[node.0].last_failure_at = Some(now);
        self.stop_subtree(node).await;
    }

    /// Stop `targets` in reverse order, then start them in order. Restarted
    /// subtrees other than the failed node get a fresh restart budget.
    async fn restart(
        &mut self,
        targets: &[NodeId],
        failed: NodeId,
    ) -> (Vec<String>, Option<NodeId>) {
        for target in targets.iter().rev() {
            self.stop_subtree(*target).await;
        }
        let mut restarted = Vec::new();
        let mut first_failure = None;
        for target in targets {
            for node in self.subtree(*target) {
                if node != failed {
                    self.nodes[node.0].restarts.clear();
                }
                match self.start_node(node).await {
                    Ok(()) => restarted.push(self.nodes[node.0].name.clone()),
                    Err(e) => {
                        error!(entity = %self.nodes[node.0].name, error = %e, "start failed");
                        first_failure.get_or_insert(node);
                    }
                }
            }
        }
        (restarted, first_failure)
    }

    async fn start_node(&mut self, node: NodeId) -> Result<()> {
        let entry = &mut self.nodes[node.0];
        let result = match &mut entry.kind {
            NodeKind::Worker { entity } => entity.start().await,
            NodeKind::Supervisor { .. } => Ok(()),
        };
        entry.running = result.is_ok();
        result
    }

    async fn stop_subtree(&mut self, node: NodeId) {
        for id in self.subtree(node).into_iter().rev() {
            let entry = &mut self.nodes[id.0];
            if let NodeKind::Worker { entity } = &mut entry.kind {
                if entry.running {
                    entity.stop().await;
                }
            }
            entry.running = false;
        }
    }

    /// `node` and its descendants, parents before children.
    fn subtree(&self, node: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let NodeKind::Supervisor { children, .. } = &self.nodes[id.0].kind {
                stack.extend(children.iter().rev().copied());
            }
        }
        order
    }

    async fn root_exhausted(&mut self, origin: &str) -> Error {
        let root = self.root();
        error!(
            root = %self.nodes[root.0].name,
            failed = %origin,
            "restart limit exceeded at the root; stopping its children"
        );
        self.bus
            .emit(ObservabilityEvent::supervisor_escalation(
                self.nodes[root.0].name.clone(),
                origin.to_string(),
                None,
            ))
            .await;
        self.stop_all().await;
        self.nodes[root.0].running = true;
        Error::RestartLimitExceeded {
            entity: origin.to_string(),
            max_restarts: self.config.max_restarts,
            window_ms: self.config.restart_window_ms,
        }
    }

    fn ensure_exists(&self, node: NodeId) -> Result<()> {
        if node.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(self.not_found(node))
        }
    }

    fn ensure_supervisor(&self, node: NodeId) -> Result<()> {
        match self.nodes.get(node.0).map(|n| &n.kind) {
            Some(NodeKind::Supervisor { .. }) => Ok(()),
            _ => Err(self.not_found(node)),
        }
    }

    fn not_found(&self, node: NodeId) -> Error {
        Error::EntityNotFound {
            entity: self
                .nodes
                .get(node.0)
                .map_or_else(|| node.to_string(), |n| n.name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    type Log = Arc<StdMutex<Vec<String>>>;

    struct Recorder {
        name: String,
        log: Log,
        fail_starts: u32,
    }

    impl Recorder {
        fn boxed(name: &str, log: &Log) -> Box<dyn Supervised> {
            Box::new(Self {
                name: name.to_string(),
                log: Arc::clone(log),
                fail_starts: 0,
            })
        }
    }

    #[async_trait]
    impl Supervised for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            if self.fail_starts > 0 {
                self.fail_starts -= 1;
                return Err(Error::StartFailed {
                    entity: self.name.clone(),
                    reason: "boom".into(),
                });
            }
            Ok(())
        }

        async fn stop(&mut self) {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }
    }

    fn config(max_restarts: u32) -> SupervisorConfig {
        SupervisorConfig {
            max_restarts,
            restart_window_ms: 60_000,
        }
    }

    async fn tree_with(
        strategy: RestartStrategy,
        names: &[&str],
        max_restarts: u32,
    ) -> (SupervisorTree, Vec<NodeId>, Log) {
        let log: Log = Arc::default();
        let mut tree =
            SupervisorTree::new("root", strategy, config(max_restarts), EventBus::in_memory());
        let mut ids = Vec::new();
        for name in names {
            ids.push(
                tree.add_worker(tree.root(), Recorder::boxed(name, &log))
                    .await
                    .unwrap(),
            );
        }
        log.lock().unwrap().clear();
        (tree, ids, log)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn one_for_one_restarts_only_the_failed_child() {
        let (mut tree, ids, log) =
            tree_with(RestartStrategy::OneForOne, &["a", "b", "c"], 3).await;

        let report = tree.report_failure(ids[1], "crash").await.unwrap();

        assert_eq!(report.restarted, vec!["b"]);
        assert_eq!(entries(&log), vec!["stop b", "start b"]);
        assert_eq!(tree.status(ids[1]).unwrap().restart_count, 1);
    }

    #[tokio::test]
    async fn one_for_all_restarts_every_sibling() {
        let (mut tree, ids, log) =
            tree_with(RestartStrategy::OneForAll, &["a", "b", "c"], 3).await;

        let report = tree.report_failure(ids[0], "crash").await.unwrap();

        assert_eq!(report.restarted, vec!["a", "b", "c"]);
        assert_eq!(
            entries(&log),
            vec!["stop a", "stop c", "stop b", "start a", "start b", "start c"]
        );
    }

    #[tokio::test]
    async fn rest_for_one_restarts_later_siblings_only() {
        let (mut tree, ids, log) =
            tree_with(RestartStrategy::RestForOne, &["a", "b", "c", "d"], 3).await;

        let report = tree.report_failure(ids[1], "crash").await.unwrap();

        assert_eq!(report.restarted, vec!["b", "c", "d"]);
        let log = entries(&log);
        assert!(!log.iter().any(|e| e.ends_with(" a")));
        assert_eq!(
            log,
            vec!["stop b", "stop d", "stop c", "start b", "start c", "start d"]
        );
        assert!(tree.is_running(ids[0]));
    }

    #[tokio::test]
    async fn exhausting_the_budget_escalates_to_the_parent() {
        let log: Log = Arc::default();
        let mut tree =
            SupervisorTree::new("root", RestartStrategy::OneForOne, config(1), EventBus::in_memory());
        let team = tree
            .add_supervisor(tree.root(), "team", RestartStrategy::OneForOne)
            .unwrap();
        let worker = tree.add_worker(team, Recorder::boxed("w1", &log)).await.unwrap();
        tree.add_worker(team, Recorder::boxed("w2", &log)).await.unwrap();
        log.lock().unwrap().clear();

        tree.report_failure(worker, "crash").await.unwrap();
        log.lock().unwrap().clear();

        let report = tree.report_failure(worker, "crash again").await.unwrap();
        assert_eq!(report.escalations, 1);
        assert_eq!(report.restarted, vec!["team", "w1", "w2"]);
        assert!(entries(&log).contains(&"start w2".to_string()));
        assert_eq!(tree.status(team).unwrap().restart_count, 1);
    }

    #[tokio::test]
    async fn root_exhaustion_stops_children_and_reports() {
        let (mut tree, ids, log) = tree_with(RestartStrategy::OneForOne, &["a", "b"], 1).await;

        tree.report_failure(ids[0], "crash").await.unwrap();
        let err = tree.report_failure(ids[0], "crash").await.unwrap_err();

        assert!(matches!(
            err,
            Error::RestartLimitExceeded { ref entity, max_restarts: 1, .. } if entity == "a"
        ));
        assert!(!tree.is_running(ids[0]));
        assert!(!tree.is_running(ids[1]));
        assert!(tree.is_running(tree.root()));
        assert!(entries(&log).contains(&"stop b".to_string()));
    }

    #[tokio::test]
    async fn failed_start_is_not_added() {
        let log: Log = Arc::default();
        let mut tree =
            SupervisorTree::new("root", RestartStrategy::OneForOne, config(3), EventBus::in_memory());
        let broken = Box::new(Recorder {
            name: "broken".into(),
            log: Arc::clone(&log),
            fail_starts: 1,
        });
        let err = tree.add_worker(tree.root(), broken).await.unwrap_err();
        assert!(matches!(err, Error::StartFailed { .. }));
        assert!(tree.children(tree.root()).is_empty());
    }

    #[tokio::test]
    async fn unknown_node_is_reported() {
        let (mut tree, _, _) = tree_with(RestartStrategy::OneForOne, &["a"], 3).await;
        let err = tree
            .report_failure(NodeId::from_index(42), "crash")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));
    }
}
