//! Agent location registry.
//!
//! An eventually-consistent map from agent id to hosting process. Entries are
//! ordered by vector clocks and merged as a state-based CRDT:
//!
//! - a causally later entry replaces an earlier one;
//! - equal clocks prefer the tombstone, then the deterministic tie-break;
//! - concurrent clocks pick a winner by greater hosting process id, then
//!   tombstone, then clock order, then content, and the winner carries the
//!   pointwise maximum of both clocks.
//!
//! Deregistration writes a tombstone that is garbage collected after the
//! retention window. While the partition is degraded, local writes are queued
//! and applied with fresh clocks once the cluster heals.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use murmur_core::{
    AgentId, Causality, Error, ProcessId, ProcessIdentity, RegistryConfig, Result, VectorClock,
};

use crate::gossip::TransmitQueue;

/// Where an agent lives, or a tombstone saying it left.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationEntry {
    pub agent_id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
    pub hosting_process: ProcessIdentity,
    pub clock: VectorClock,
    pub tombstone_at: Option<DateTime<Utc>>,
}

impl RegistrationEntry {
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.tombstone_at.is_some()
    }

    /// Tie-break key for concurrent writes.
    #[allow(clippy::type_complexity)]
    fn precedence(
        &self,
    ) -> (
        &ProcessId,
        bool,
        &VectorClock,
        &ProcessIdentity,
        &BTreeSet<String>,
        &BTreeMap<String, String>,
        Option<DateTime<Utc>>,
    ) {
        (
            &self.hosting_process.id,
            self.is_tombstone(),
            &self.clock,
            &self.hosting_process,
            &self.capabilities,
            &self.metadata,
            self.tombstone_at,
        )
    }
}

/// Merge two versions of the same agent's entry.
///
/// Commutative and idempotent: `resolve(a, b) == resolve(b, a)` and
/// `resolve(a, a) == a`.
#[must_use]
pub fn resolve(local: &RegistrationEntry, incoming: &RegistrationEntry) -> RegistrationEntry {
    match incoming.clock.causality(&local.clock) {
        Causality::After => incoming.clone(),
        Causality::Before => local.clone(),
        Causality::Equal => {
            let winner = match (local.is_tombstone(), incoming.is_tombstone()) {
                (true, false) => local,
                (false, true) => incoming,
                _ if incoming.precedence() > local.precedence() => incoming,
                _ => local,
            };
            winner.clone()
        }
        Causality::Concurrent => {
            let winner = if incoming.precedence() > local.precedence() {
                incoming
            } else {
                local
            };
            RegistrationEntry {
                clock: local.clock.joined(&incoming.clock),
                ..winner.clone()
            }
        }
    }
}

/// Per-agent clocks, exchanged during anti-entropy.
pub type RegistryDigest = BTreeMap<AgentId, VectorClock>;

/// The registry's merge state. Pure and synchronous.
#[derive(Debug, Clone)]
pub struct RegistryState {
    local: ProcessIdentity,
    entries: BTreeMap<AgentId, RegistrationEntry>,
    failed_hosts: BTreeSet<ProcessId>,
    /// Highest component stamped or seen under the local id. Local writes
    /// go above it.
    own_writes: u64,
}

impl RegistryState {
    #[must_use]
    pub fn new(local: ProcessIdentity) -> Self {
        Self {
            local,
            entries: BTreeMap::new(),
            failed_hosts: BTreeSet::new(),
            own_writes: 0,
        }
    }

    /// Record that `agent_id` is hosted by the local process.
    pub fn register(
        &mut self,
        agent_id: AgentId,
        capabilities: BTreeSet<String>,
        metadata: BTreeMap<String, String>,
    ) -> RegistrationEntry {
        let base = self
            .entries
            .get(&agent_id)
            .map(|e| e.clock.clone())
            .unwrap_or_default();
        let clock = self.stamp(base);
        let entry = RegistrationEntry {
            agent_id: agent_id.clone(),
            capabilities,
            metadata,
            hosting_process: self.local.clone(),
            clock,
            tombstone_at: None,
        };
        self.entries.insert(agent_id, entry.clone());
        entry
    }

    /// Replace the live entry for `agent_id` with a tombstone.
    ///
    /// # Errors
    ///
    /// `Error::AgentNotRegistered` if there is no live entry.
    pub fn deregister(&mut self, agent_id: &AgentId, now: DateTime<Utc>) -> Result<RegistrationEntry> {
        let current = self
            .entries
            .get(agent_id)
            .filter(|e| !e.is_tombstone())
            .cloned()
            .ok_or_else(|| Error::AgentNotRegistered {
                agent_id: agent_id.to_string(),
            })?;
        let tombstone = RegistrationEntry {
            clock: self.stamp(current.clock.clone()),
            tombstone_at: Some(now),
            ..current
        };
        self.entries.insert(agent_id.clone(), tombstone.clone());
        Ok(tombstone)
    }

    /// Merge one remote entry. Returns the new local entry if it changed.
    ///
    /// A live local registration that loses to a write stamped under this
    /// process's id by an earlier run is re-stamped above it first, then
    /// merged as usual.
    pub fn merge_entry(&mut self, incoming: RegistrationEntry) -> Option<RegistrationEntry> {
        let seen = incoming.clock.get(&self.local.id);
        self.own_writes = self.own_writes.max(seen);
        let stale = self.entries.get(&incoming.agent_id).filter(|local| {
            !local.is_tombstone()
                && local.hosting_process.id == self.local.id
                && local.clock.get(&self.local.id) < seen
        });
        if let Some(local) = stale.cloned() {
            let restamped = RegistrationEntry {
                clock: self.stamp(local.clock.clone()),
                ..local
            };
            info!(
                agent_id = %restamped.agent_id,
                clock = %restamped.clock,
                "re-stamped registration shadowed by an earlier run of this process"
            );
            let merged = resolve(&restamped, &incoming);
            self.entries.insert(merged.agent_id.clone(), merged.clone());
            return Some(merged);
        }
        match self.entries.get(&incoming.agent_id) {
            Some(local) => {
                let merged = resolve(local, &incoming);
                if &merged == local {
                    None
                } else {
                    self.entries.insert(merged.agent_id.clone(), merged.clone());
                    Some(merged)
                }
            }
            None => {
                self.entries
                    .insert(incoming.agent_id.clone(), incoming.clone());
                Some(incoming)
            }
        }
    }

    /// Merge many remote entries, returning those that changed local state.
    pub fn merge(
        &mut self,
        incoming: impl IntoIterator<Item = RegistrationEntry>,
    ) -> Vec<RegistrationEntry> {
        incoming
            .into_iter()
            .filter_map(|entry| self.merge_entry(entry))
            .collect()
    }

    /// Hosting process of a live agent whose host is not marked failed.
    #[must_use]
    pub fn resolve(&self, agent_id: &AgentId) -> Option<ProcessIdentity> {
        self.entries
            .get(agent_id)
            .filter(|e| self.is_routable(e))
            .map(|e| e.hosting_process.clone())
    }

    /// Raw entry, tombstones included.
    #[must_use]
    pub fn get(&self, agent_id: &AgentId) -> Option<&RegistrationEntry> {
        self.entries.get(agent_id)
    }

    /// Live, routable entries advertising `capability`.
    #[must_use]
    pub fn find_by_capability(&self, capability: &str) -> Vec<RegistrationEntry> {
        self.entries
            .values()
            .filter(|e| self.is_routable(e) && e.capabilities.contains(capability))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn digest(&self) -> RegistryDigest {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.clock.clone()))
            .collect()
    }

    /// Entries the holder of `digest` has not seen: missing, or not dominated
    /// by the clock in the digest.
    #[must_use]
    pub fn entries_newer_than(&self, digest: &RegistryDigest) -> Vec<RegistrationEntry> {
        self.entries
            .values()
            .filter(|e| digest.get(&e.agent_id).is_none_or(|seen| !seen.dominates(&e.clock)))
            .cloned()
            .collect()
    }

    /// Drop tombstones older than `retention`. Returns how many were removed.
    pub fn gc_tombstones(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let before = self.entries.len();
        self.entries.retain(|_, e| match e.tombstone_at {
            Some(at) => now.signed_duration_since(at) < retention,
            None => true,
        });
        before - self.entries.len()
    }

    /// Stop resolving agents hosted by `process`.
    pub fn mark_process_failed(&mut self, process: &ProcessId) -> bool {
        self.failed_hosts.insert(process.clone())
    }

    /// Resume resolving agents hosted by `process`.
    pub fn mark_process_recovered(&mut self, process: &ProcessId) -> bool {
        self.failed_hosts.remove(process)
    }

    #[must_use]
    pub fn is_failed(&self, process: &ProcessId) -> bool {
        self.failed_hosts.contains(process)
    }

    /// Every entry, tombstones included.
    pub fn entries(&self) -> impl Iterator<Item = &RegistrationEntry> {
        self.entries.values()
    }

    /// Live agents hosted by `process`.
    #[must_use]
    pub fn hosted_by(&self, process: &ProcessId) -> Vec<AgentId> {
        self.entries
            .values()
            .filter(|e| !e.is_tombstone() && &e.hosting_process.id == process)
            .map(|e| e.agent_id.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `base` advanced to the next local write.
    fn stamp(&mut self, mut base: VectorClock) -> VectorClock {
        let next = self
            .own_writes
            .max(base.get(&self.local.id))
            .saturating_add(1);
        self.own_writes = next;
        base.advance_to(&self.local.id, next);
        base
    }

    fn is_routable(&self, entry: &RegistrationEntry) -> bool {
        !entry.is_tombstone() && !self.failed_hosts.contains(&entry.hosting_process.id)
    }
}

/// Whether local writes apply immediately or wait for the partition to heal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Apply and gossip local writes.
    Authoritative,
    /// Queue local writes; nothing is gossiped until replay.
    Queued,
}

/// Result of a local registry write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Applied and queued for gossip.
    Applied(RegistrationEntry),
    /// Held until the partition heals.
    Queued,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Register {
        agent_id: AgentId,
        capabilities: BTreeSet<String>,
        metadata: BTreeMap<String, String>,
    },
    Deregister {
        agent_id: AgentId,
    },
}

/// Shared handle over the registry state.
pub struct AgentRegistry {
    local: ProcessIdentity,
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    mode: RwLock<WriteMode>,
    pending: Mutex<Vec<PendingWrite>>,
    outbox: Mutex<TransmitQueue<AgentId, RegistrationEntry>>,
}

impl AgentRegistry {
    #[must_use]
    pub fn new(local: ProcessIdentity, config: RegistryConfig) -> Self {
        Self {
            state: RwLock::new(RegistryState::new(local.clone())),
            local,
            config,
            mode: RwLock::new(WriteMode::Authoritative),
            pending: Mutex::new(Vec::new()),
            outbox: Mutex::new(TransmitQueue::new()),
        }
    }

    #[must_use]
    pub const fn local(&self) -> &ProcessIdentity {
        &self.local
    }

    /// Register a locally hosted agent.
    ///
    /// # Errors
    ///
    /// Infallible today; kept fallible alongside `deregister`.
    pub async fn register(
        &self,
        agent_id: AgentId,
        capabilities: BTreeSet<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<WriteOutcome> {
        if *self.mode.read().await == WriteMode::Queued {
            debug!(agent_id = %agent_id, "registry degraded, queueing registration");
            self.pending.lock().await.push(PendingWrite::Register {
                agent_id,
                capabilities,
                metadata,
            });
            return Ok(WriteOutcome::Queued);
        }
        let entry = self
            .state
            .write()
            .await
            .register(agent_id, capabilities, metadata);
        info!(agent_id = %entry.agent_id, clock = %entry.clock, "agent registered");
        self.enqueue(&entry).await;
        Ok(WriteOutcome::Applied(entry))
    }

    /// Deregister an agent, writing a tombstone.
    ///
    /// # Errors
    ///
    /// `Error::AgentNotRegistered` if no live entry exists.
    pub async fn deregister(&self, agent_id: &AgentId) -> Result<WriteOutcome> {
        if *self.mode.read().await == WriteMode::Queued {
            debug!(agent_id = %agent_id, "registry degraded, queueing deregistration");
            self.pending.lock().await.push(PendingWrite::Deregister {
                agent_id: agent_id.clone(),
            });
            return Ok(WriteOutcome::Queued);
        }
        let tombstone = self.state.write().await.deregister(agent_id, Utc::now())?;
        info!(agent_id = %agent_id, clock = %tombstone.clock, "agent deregistered");
        self.enqueue(&tombstone).await;
        Ok(WriteOutcome::Applied(tombstone))
    }

    /// Hosting process of a routable agent.
    pub async fn resolve(&self, agent_id: &AgentId) -> Option<ProcessIdentity> {
        self.state.read().await.resolve(agent_id)
    }

    /// Raw entry for an agent, tombstones included.
    pub async fn entry(&self, agent_id: &AgentId) -> Option<RegistrationEntry> {
        self.state.read().await.get(agent_id).cloned()
    }

    /// Merge remote entries. Changed entries are re-gossiped.
    pub async fn merge(&self, incoming: Vec<RegistrationEntry>) -> usize {
        if incoming.is_empty() {
            return 0;
        }
        let changed = self.state.write().await.merge(incoming);
        if !changed.is_empty() {
            debug!(changed = changed.len(), "merged remote registry entries");
            let mut outbox = self.outbox.lock().await;
            for entry in &changed {
                outbox.push(entry.agent_id.clone(), entry.clone());
            }
        }
        changed.len()
    }

    pub async fn find_by_capability(&self, capability: &str) -> Vec<RegistrationEntry> {
        self.state.read().await.find_by_capability(capability)
    }

    pub async fn digest(&self) -> RegistryDigest {
        self.state.read().await.digest()
    }

    pub async fn entries_newer_than(&self, digest: &RegistryDigest) -> Vec<RegistrationEntry> {
        self.state.read().await.entries_newer_than(digest)
    }

    /// Drop expired tombstones.
    pub async fn gc_tombstones(&self, now: DateTime<Utc>) -> usize {
        let removed = self
            .state
            .write()
            .await
            .gc_tombstones(now, self.config.tombstone_retention());
        if removed > 0 {
            debug!(removed, "collected registry tombstones");
        }
        removed
    }

    pub async fn mark_process_failed(&self, process: &ProcessId) {
        if self.state.write().await.mark_process_failed(process) {
            info!(process = %process, "host marked failed; its agents no longer resolve");
        }
    }

    pub async fn mark_process_recovered(&self, process: &ProcessId) {
        if self.state.write().await.mark_process_recovered(process) {
            info!(process = %process, "host recovered");
        }
    }

    pub async fn write_mode(&self) -> WriteMode {
        *self.mode.read().await
    }

    pub async fn set_write_mode(&self, mode: WriteMode) {
        let mut current = self.mode.write().await;
        if *current != mode {
            info!(from = ?*current, to = ?mode, "registry write mode changed");
            *current = mode;
        }
    }

    /// Number of local writes waiting for the partition to heal.
    pub async fn pending_writes(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Apply queued local writes with fresh clocks, in the order they were made.
    ///
    /// Deregistering an agent that is no longer registered is skipped.
    pub async fn replay_pending(&self) -> Vec<RegistrationEntry> {
        let pending = std::mem::take(&mut *self.pending.lock().await);
        if pending.is_empty() {
            return Vec::new();
        }
        let mut applied = Vec::with_capacity(pending.len());
        {
            let mut state = self.state.write().await;
            for write in pending {
                match write {
                    PendingWrite::Register {
                        agent_id,
                        capabilities,
                        metadata,
                    } => applied.push(state.register(agent_id, capabilities, metadata)),
                    PendingWrite::Deregister { agent_id } => {
                        match state.deregister(&agent_id, Utc::now()) {
                            Ok(tombstone) => applied.push(tombstone),
                            Err(e) => debug!(agent_id = %agent_id, error = %e, "skipping queued deregistration"),
                        }
                    }
                }
            }
        }
        let mut outbox = self.outbox.lock().await;
        for entry in &applied {
            outbox.push(entry.agent_id.clone(), entry.clone());
        }
        info!(replayed = applied.len(), "replayed queued registry writes");
        applied
    }

    /// Entries to piggyback on the next gossip payload.
    pub async fn gossip_batch(&self, max: usize, limit: u32) -> Vec<RegistrationEntry> {
        if max == 0 {
            return Vec::new();
        }
        self.outbox.lock().await.take(max, limit)
    }

    /// Every entry, tombstones included, for snapshots and anti-entropy.
    pub async fn all_entries(&self) -> Vec<RegistrationEntry> {
        self.state.read().await.entries().cloned().collect()
    }

    /// Live agents hosted by `process`.
    pub async fn hosted_by(&self, process: &ProcessId) -> Vec<AgentId> {
        self.state.read().await.hosted_by(process)
    }

    /// Load entries from a snapshot without gossiping them.
    pub async fn restore(&self, entries: Vec<RegistrationEntry>) -> usize {
        self.state.write().await.merge(entries).len()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.is_empty()
    }

    async fn enqueue(&self, entry: &RegistrationEntry) {
        self.outbox
            .lock()
            .await
            .push(entry.agent_id.clone(), entry.clone());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use proptest::prelude::*;
    use std::net::SocketAddr;

    fn identity(id: &str, port: u16) -> ProcessIdentity {
        ProcessIdentity::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn entry(agent: &str, host: &str, clock: VectorClock) -> RegistrationEntry {
        RegistrationEntry {
            agent_id: AgentId::new(agent),
            capabilities: BTreeSet::from(["plan".to_string()]),
            metadata: BTreeMap::new(),
            hosting_process: identity(host, 9000),
            clock,
            tombstone_at: None,
        }
    }

    #[test]
    fn later_clock_wins() {
        let old = entry("a", "p1", VectorClock::from([("p1", 1)]));
        let new = entry("a", "p2", VectorClock::from([("p1", 1), ("p2", 1)]));
        assert_eq!(resolve(&old, &new), new);
        assert_eq!(resolve(&new, &old), new);
    }

    #[test]
    fn equal_clocks_prefer_tombstone() {
        let live = entry("a", "p9", VectorClock::from([("p1", 2)]));
        let dead = RegistrationEntry {
            tombstone_at: Some(Utc::now()),
            hosting_process: identity("p1", 9000),
            ..live.clone()
        };
        assert!(resolve(&live, &dead).is_tombstone());
        assert!(resolve(&dead, &live).is_tombstone());
    }

    #[test]
    fn concurrent_writes_pick_greater_host_and_join_clocks() {
        let a = entry("x", "p1", VectorClock::from([("p1", 1)]));
        let b = entry("x", "p2", VectorClock::from([("p2", 1)]));

        let merged = resolve(&a, &b);
        assert_eq!(merged.hosting_process.id, ProcessId::new("p2"));
        assert_eq!(merged.clock, VectorClock::from([("p1", 1), ("p2", 1)]));
        assert_eq!(resolve(&b, &a), merged);
        assert!(merged.clock.dominates(&a.clock));
        assert!(merged.clock.dominates(&b.clock));
    }

    #[test]
    fn deregister_writes_a_tombstone() {
        let mut state = RegistryState::new(identity("p1", 9000));
        state.register(AgentId::new("a"), BTreeSet::new(), BTreeMap::new());
        let tombstone = state.deregister(&AgentId::new("a"), Utc::now()).unwrap();

        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.clock, VectorClock::from([("p1", 2)]));
        assert!(state.resolve(&AgentId::new("a")).is_none());
        assert!(state.get(&AgentId::new("a")).is_some());
        assert!(matches!(
            state.deregister(&AgentId::new("a"), Utc::now()),
            Err(Error::AgentNotRegistered { .. })
        ));
    }

    #[test]
    fn tombstones_are_collected_after_retention() {
        let mut state = RegistryState::new(identity("p1", 9000));
        state.register(AgentId::new("a"), BTreeSet::new(), BTreeMap::new());
        let at = Utc::now();
        state.deregister(&AgentId::new("a"), at).unwrap();

        assert_eq!(state.gc_tombstones(at, Duration::from_secs(60)), 0);
        let later = at + chrono::Duration::seconds(61);
        assert_eq!(state.gc_tombstones(later, Duration::from_secs(60)), 1);
        assert!(state.is_empty());
    }

    #[test]
    fn failed_hosts_do_not_resolve() {
        let mut state = RegistryState::new(identity("p1", 9000));
        state.merge([entry("a", "p2", VectorClock::from([("p2", 1)]))]);
        assert!(state.resolve(&AgentId::new("a")).is_some());

        state.mark_process_failed(&ProcessId::new("p2"));
        assert!(state.resolve(&AgentId::new("a")).is_none());
        assert!(state.find_by_capability("plan").is_empty());

        state.mark_process_recovered(&ProcessId::new("p2"));
        assert_eq!(state.find_by_capability("plan").len(), 1);
    }

    #[test]
    fn digest_exchange_finds_missing_entries() {
        let mut left = RegistryState::new(identity("p1", 9000));
        let mut right = RegistryState::new(identity("p2", 9001));
        left.register(AgentId::new("a"), BTreeSet::new(), BTreeMap::new());
        right.register(AgentId::new("b"), BTreeSet::new(), BTreeMap::new());

        let for_right = left.entries_newer_than(&right.digest());
        assert_eq!(for_right.len(), 1);
        right.merge(for_right);
        left.merge(right.entries_newer_than(&left.digest()));

        assert_eq!(left.digest(), right.digest());
        assert!(left.entries_newer_than(&right.digest()).is_empty());
    }

    #[tokio::test]
    async fn queued_writes_replay_with_fresh_clocks() {
        let registry = AgentRegistry::new(identity("p1", 9000), RegistryConfig::default());
        registry.set_write_mode(WriteMode::Queued).await;

        let outcome = registry
            .register(AgentId::new("a"), BTreeSet::new(), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);
        assert!(registry.entry(&AgentId::new("a")).await.is_none());
        assert!(registry.gossip_batch(8, 3).await.is_empty());

        registry.set_write_mode(WriteMode::Authoritative).await;
        let replayed = registry.replay_pending().await;
        assert_eq!(replayed.len(), 1);
        assert_eq!(registry.pending_writes().await, 0);
        assert!(registry.resolve(&AgentId::new("a")).await.is_some());
        assert_eq!(registry.gossip_batch(8, 3).await.len(), 1);
    }

    #[tokio::test]
    async fn merged_changes_are_regossiped() {
        let registry = AgentRegistry::new(identity("p1", 9000), RegistryConfig::default());
        let remote = entry("a", "p2", VectorClock::from([("p2", 1)]));

        assert_eq!(registry.merge(vec![remote.clone()]).await, 1);
        assert_eq!(registry.merge(vec![remote.clone()]).await, 0);
        assert_eq!(registry.gossip_batch(8, 3).await, vec![remote]);
    }

    #[test]
    fn restarted_process_registration_outlives_its_old_tombstone() {
        let agent = AgentId::new("x");
        let mut before_restart = RegistryState::new(identity("p1", 9000));
        let mut peer = RegistryState::new(identity("p2", 9001));
        peer.merge([before_restart.register(agent.clone(), BTreeSet::new(), BTreeMap::new())]);
        peer.merge([before_restart.deregister(&agent, Utc::now()).unwrap()]);
        assert!(peer.resolve(&agent).is_none());

        let mut restarted = RegistryState::new(identity("p1", 9000));
        let fresh = restarted.register(agent.clone(), BTreeSet::new(), BTreeMap::new());
        assert_eq!(fresh.clock, VectorClock::from([("p1", 1)]));
        peer.merge([fresh]);
        assert!(peer.resolve(&agent).is_none());

        let changed = restarted.merge(peer.entries().cloned().collect::<Vec<_>>());
        assert_eq!(restarted.resolve(&agent), Some(identity("p1", 9000)));
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].clock, VectorClock::from([("p1", 3)]));

        peer.merge(changed);
        assert_eq!(peer.resolve(&agent), Some(identity("p1", 9000)));
    }

    #[test]
    fn restamp_does_not_override_a_concurrent_move() {
        let agent = AgentId::new("x");
        let mut restarted = RegistryState::new(identity("p1", 9000));
        restarted.register(agent.clone(), BTreeSet::new(), BTreeMap::new());

        // p2 took the agent over after seeing the previous run's tombstone.
        let moved = entry("x", "p2", VectorClock::from([("p1", 2), ("p2", 1)]));
        restarted.merge([moved]);
        assert_eq!(restarted.resolve(&agent).unwrap().id, ProcessId::new("p2"));
    }

    #[tokio::test]
    async fn restored_clocks_seed_new_local_writes() {
        let registry = AgentRegistry::new(identity("p1", 9000), RegistryConfig::default());
        let mut old = entry("y", "p1", VectorClock::from([("p1", 4)]));
        old.tombstone_at = Some(Utc::now());
        registry.restore(vec![old]).await;

        let WriteOutcome::Applied(applied) = registry
            .register(AgentId::new("x"), BTreeSet::new(), BTreeMap::new())
            .await
            .unwrap()
        else {
            panic!("registration was queued");
        };
        assert_eq!(applied.clock, VectorClock::from([("p1", 5)]));
    }

    fn arb_entry() -> impl Strategy<Value = RegistrationEntry> {
        (
            prop::collection::btree_map("p[1-3]", 1u64..4, 1..3),
            "p[1-3]",
            any::<bool>(),
            "[a-c]",
        )
            .prop_map(|(clock, host, dead, capability)| RegistrationEntry {
                agent_id: AgentId::new("agent"),
                capabilities: BTreeSet::from([capability]),
                metadata: BTreeMap::new(),
                hosting_process: identity(&host, 9000),
                clock: clock
                    .into_iter()
                    .fold(VectorClock::new(), |mut c, (p, n)| {
                        let id = ProcessId::new(p);
                        for _ in 0..n {
                            c.increment(&id);
                        }
                        c
                    }),
                tombstone_at: dead.then(|| DateTime::<Utc>::UNIX_EPOCH),
            })
    }

    fn merged_state(entries: &[RegistrationEntry]) -> BTreeMap<AgentId, RegistrationEntry> {
        let mut state = RegistryState::new(identity("observer", 1));
        state.merge(entries.iter().cloned());
        state
            .entries()
            .map(|e| (e.agent_id.clone(), e.clone()))
            .collect()
    }

    proptest! {
        #[test]
        fn resolve_is_commutative(a in arb_entry(), b in arb_entry()) {
            prop_assert_eq!(resolve(&a, &b), resolve(&b, &a));
        }

        #[test]
        fn resolve_is_idempotent(a in arb_entry(), b in arb_entry()) {
            let once = resolve(&a, &b);
            prop_assert_eq!(resolve(&once, &b), once.clone());
            prop_assert_eq!(resolve(&a, &a), a);
        }

        #[test]
        fn merge_order_does_not_matter_for_two_replicas(a in arb_entry(), b in arb_entry()) {
            prop_assert_eq!(merged_state(&[a.clone(), b.clone()]), merged_state(&[b, a]));
        }
    }
}
