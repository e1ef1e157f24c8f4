//! Partition classification and degraded-mode control.
//!
//! The manager re-evaluates on every membership view change. Entering a
//! degraded state switches the registry to queued writes; returning to
//! `Majority` runs anti-entropy with reachable peers and replays queued
//! writes before the new state is published, so routers that replay held
//! messages on `Majority` see a healed registry.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use murmur_core::{MemberStatus, PartitionConfig, PartitionState};
use murmur_events::{EventBus, ObservabilityEvent};

use crate::anti_entropy;
use crate::membership::{Membership, MembershipView};
use crate::registry::{AgentRegistry, WriteMode};
use crate::transport::ClusterTransport;

/// Pure classifier with transition detection.
#[derive(Debug, Clone)]
pub struct PartitionTracker {
    quorum: usize,
    state: PartitionState,
}

impl PartitionTracker {
    /// Starts from the classification of a lone process.
    #[must_use]
    pub const fn new(quorum: usize) -> Self {
        Self {
            quorum,
            state: PartitionState::classify(1, quorum),
        }
    }

    #[must_use]
    pub const fn state(&self) -> PartitionState {
        self.state
    }

    #[must_use]
    pub const fn quorum(&self) -> usize {
        self.quorum
    }

    /// Classify `alive` (self included); returns `(from, to)` on change.
    pub fn observe(&mut self, alive: usize) -> Option<(PartitionState, PartitionState)> {
        let next = PartitionState::classify(alive, self.quorum);
        if next == self.state {
            return None;
        }
        let from = std::mem::replace(&mut self.state, next);
        Some((from, next))
    }
}

/// Handle to the partition manager task.
#[derive(Clone)]
pub struct PartitionManager {
    state: watch::Receiver<PartitionState>,
    shutdown: Arc<Notify>,
}

impl PartitionManager {
    /// Spawn the manager. `exchange_timeout` bounds each anti-entropy call.
    #[must_use]
    pub fn start(
        membership: &Membership,
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn ClusterTransport>,
        bus: EventBus,
        config: &PartitionConfig,
        exchange_timeout: Duration,
    ) -> Self {
        let tracker = PartitionTracker::new(config.quorum);
        let (state_tx, state) = watch::channel(tracker.state());
        let shutdown = Arc::new(Notify::new());

        let task = ManagerTask {
            tracker,
            registry,
            transport,
            bus,
            state_tx,
            exchange_timeout,
        };
        tokio::spawn(task.run(membership.watch(), Arc::clone(&shutdown)));

        Self { state, shutdown }
    }

    #[must_use]
    pub fn state(&self) -> PartitionState {
        *self.state.borrow()
    }

    /// Receiver notified on every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PartitionState> {
        self.state.clone()
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

struct ManagerTask {
    tracker: PartitionTracker,
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn ClusterTransport>,
    bus: EventBus,
    state_tx: watch::Sender<PartitionState>,
    exchange_timeout: Duration,
}

impl ManagerTask {
    async fn run(
        mut self,
        mut views: watch::Receiver<Arc<MembershipView>>,
        shutdown: Arc<Notify>,
    ) {
        let initial = Arc::clone(&views.borrow_and_update());
        self.evaluate(&initial).await;

        loop {
            tokio::select! {
                changed = views.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let view = Arc::clone(&views.borrow_and_update());
                    self.evaluate(&view).await;
                }
                () = shutdown.notified() => break,
            }
        }
    }

    async fn evaluate(&mut self, view: &MembershipView) {
        let alive = view.alive_count();
        if let Some((from, to)) = self.tracker.observe(alive) {
            info!(%from, %to, alive, quorum = self.tracker.quorum(), "partition state changed");
            match to {
                PartitionState::Majority => {
                    if from.is_degraded() {
                        self.heal(view).await;
                    }
                    self.registry.set_write_mode(WriteMode::Authoritative).await;
                    self.registry.replay_pending().await;
                }
                PartitionState::Minority | PartitionState::Isolated => {
                    self.registry.set_write_mode(WriteMode::Queued).await;
                }
            }
            self.bus
                .emit(ObservabilityEvent::partition(
                    from,
                    to,
                    alive,
                    self.tracker.quorum(),
                ))
                .await;
            self.state_tx.send_replace(to);
        }

        if self.tracker.state() == PartitionState::Majority {
            self.sync_failed_hosts(view).await;
        }
    }

    /// Only a majority may declare hosts failed.
    async fn sync_failed_hosts(&self, view: &MembershipView) {
        for member in view.members.values() {
            match member.status {
                MemberStatus::Dead | MemberStatus::Left => {
                    self.registry.mark_process_failed(&member.identity.id).await;
                }
                MemberStatus::Alive | MemberStatus::Suspect => {
                    self.registry
                        .mark_process_recovered(&member.identity.id)
                        .await;
                }
            }
        }
    }

    async fn heal(&self, view: &MembershipView) {
        let peers = view.alive_peers();
        info!(peers = peers.len(), "healing: exchanging registry digests");
        let exchanges = peers.iter().map(|peer| {
            anti_entropy::exchange(
                &self.registry,
                self.transport.as_ref(),
                peer,
                self.exchange_timeout,
            )
        });
        for (peer, result) in peers.iter().zip(join_all(exchanges).await) {
            if let Err(e) = result {
                warn!(peer = %peer, error = %e, "anti-entropy failed");
            }
        }
    }
}
