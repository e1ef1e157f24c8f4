//! SWIM state machine.
//!
//! Pure and clock-injected: every method that depends on time takes `now`,
//! and randomness comes from the caller's RNG. The protocol task owns the
//! only instance.

use rand::Rng;
use rand::seq::{IteratorRandom, SliceRandom};
use tokio::time::Instant;
use tracing::{debug, info};

use murmur_core::{MemberStatus, MembershipConfig, ProcessId, ProcessIdentity};

use crate::gossip::{self, GossipPayload, MemberDelta, TransmitQueue};
use crate::membership::view::{Member, MembershipEvent, MembershipView};

/// Whether a claim `(new, new_inc)` overrides the current `(old, old_inc)`.
#[must_use]
pub fn supersedes(new: MemberStatus, new_inc: u64, old: MemberStatus, old_inc: u64) -> bool {
    use MemberStatus::{Alive, Dead, Left, Suspect};
    match (new, old) {
        (Alive, _) => new_inc > old_inc,
        (Suspect, Alive) | (Dead | Left, Alive | Suspect) | (Left, Dead) => new_inc >= old_inc,
        (Suspect, _) | (Dead, Dead | Left) | (Left, Left) => new_inc > old_inc,
    }
}

fn transition_event(
    old: Option<MemberStatus>,
    new: MemberStatus,
    identity: &ProcessIdentity,
) -> Option<MembershipEvent> {
    use MemberStatus::{Alive, Dead, Left, Suspect};
    let identity = identity.clone();
    match (old, new) {
        (None | Some(Left), Alive | Suspect) => Some(MembershipEvent::Joined(identity)),
        (Some(Suspect | Dead), Alive) | (Some(Dead), Suspect) => {
            Some(MembershipEvent::Recovered(identity))
        }
        (Some(Alive), Suspect) => Some(MembershipEvent::Suspected(identity)),
        (Some(Alive | Suspect), Dead) => Some(MembershipEvent::Failed(identity)),
        (Some(Alive | Suspect | Dead), Left) => Some(MembershipEvent::Left(identity)),
        _ => None,
    }
}

/// Membership state owned by the protocol task.
#[derive(Debug)]
pub struct MembershipState {
    view: MembershipView,
    config: MembershipConfig,
    outbox: TransmitQueue<ProcessId, MemberDelta>,
    probe_order: Vec<ProcessId>,
    probe_index: usize,
    round: u64,
}

impl MembershipState {
    #[must_use]
    pub fn new(local: ProcessIdentity, incarnation: u64, config: MembershipConfig) -> Self {
        Self {
            view: MembershipView::new(local, incarnation),
            config,
            outbox: TransmitQueue::new(),
            probe_order: Vec::new(),
            probe_index: 0,
            round: 0,
        }
    }

    #[must_use]
    pub const fn view(&self) -> &MembershipView {
        &self.view
    }

    #[must_use]
    pub const fn local(&self) -> &ProcessIdentity {
        &self.view.local
    }

    #[must_use]
    pub const fn incarnation(&self) -> u64 {
        self.view.incarnation
    }

    #[must_use]
    pub fn has_left(&self) -> bool {
        self.view.local_status == MemberStatus::Left
    }

    #[must_use]
    pub fn knows(&self, process: &ProcessId) -> bool {
        self.view.members.contains_key(process)
    }

    /// Apply one claim. Claims about the local process trigger refutation.
    pub fn apply(&mut self, delta: &MemberDelta, now: Instant) -> Option<MembershipEvent> {
        if delta.identity.id == self.view.local.id {
            self.refute(delta);
            return None;
        }

        let old = self.view.members.get(&delta.identity.id);
        let old_status = old.map(|m| m.status);
        if let Some(m) = old {
            if !supersedes(delta.status, delta.incarnation, m.status, m.incarnation) {
                return None;
            }
        }

        self.view.members.insert(
            delta.identity.id.clone(),
            Member {
                identity: delta.identity.clone(),
                status: delta.status,
                incarnation: delta.incarnation,
                changed_at: now,
            },
        );
        self.outbox.push(delta.identity.id.clone(), delta.clone());
        transition_event(old_status, delta.status, &delta.identity)
    }

    /// Apply a whole payload: piggybacked deltas first, then the sender's own
    /// `Alive` claim.
    pub fn apply_payload(&mut self, payload: &GossipPayload, now: Instant) -> Vec<MembershipEvent> {
        let sender_claim = MemberDelta::new(
            payload.sender.clone(),
            MemberStatus::Alive,
            payload.incarnation,
        );
        payload
            .membership
            .iter()
            .chain(std::iter::once(&sender_claim))
            .filter_map(|delta| self.apply(delta, now))
            .collect()
    }

    fn refute(&mut self, delta: &MemberDelta) {
        if self.has_left() {
            return;
        }
        let stale_claim = delta.status != MemberStatus::Alive && delta.incarnation >= self.view.incarnation;
        let previous_life = delta.incarnation > self.view.incarnation;
        if stale_claim || previous_life {
            self.view.incarnation = delta.incarnation.saturating_add(1);
            info!(
                claimed = %delta.status,
                incarnation = self.view.incarnation,
                "refuting claim about self"
            );
            self.outbox.push(
                self.view.local.id.clone(),
                MemberDelta::new(
                    self.view.local.clone(),
                    MemberStatus::Alive,
                    self.view.incarnation,
                ),
            );
        }
    }

    /// Neither a direct nor an indirect probe got an answer.
    pub fn probe_failed(&mut self, target: &ProcessId, now: Instant) -> Option<MembershipEvent> {
        let member = self.view.members.get(target)?;
        if member.status != MemberStatus::Alive {
            return None;
        }
        let delta = MemberDelta::new(
            member.identity.clone(),
            MemberStatus::Suspect,
            member.incarnation,
        );
        self.apply(&delta, now)
    }

    /// Promote timed-out suspects to dead and purge expired negative entries.
    pub fn expire(&mut self, now: Instant) -> Vec<MembershipEvent> {
        let suspicion = self.config.suspicion_timeout();
        let retention = self.config.dead_retention();

        let timed_out: Vec<MemberDelta> = self
            .view
            .members
            .values()
            .filter(|m| {
                m.status == MemberStatus::Suspect
                    && now.saturating_duration_since(m.changed_at) >= suspicion
            })
            .map(|m| MemberDelta::new(m.identity.clone(), MemberStatus::Dead, m.incarnation))
            .collect();
        let events = timed_out
            .iter()
            .filter_map(|delta| self.apply(delta, now))
            .collect();

        let before = self.view.members.len();
        self.view.members.retain(|_, m| {
            m.status.is_reachable() || now.saturating_duration_since(m.changed_at) < retention
        });
        let purged = before - self.view.members.len();
        if purged > 0 {
            debug!(purged, "purged expired members");
        }
        events
    }

    /// Advance the round counter.
    pub fn start_round(&mut self) -> u64 {
        self.round = self.round.saturating_add(1);
        self.round
    }

    /// Next target from a shuffled round-robin over reachable peers.
    pub fn next_probe_target(&mut self, rng: &mut impl Rng) -> Option<ProcessIdentity> {
        for _ in 0..=self.probe_order.len() {
            if self.probe_index >= self.probe_order.len() {
                self.probe_order = self
                    .view
                    .members
                    .values()
                    .filter(|m| m.status.is_reachable())
                    .map(|m| m.identity.id.clone())
                    .collect();
                self.probe_order.shuffle(rng);
                self.probe_index = 0;
                if self.probe_order.is_empty() {
                    return None;
                }
            }
            let candidate = &self.probe_order[self.probe_index];
            self.probe_index += 1;
            if let Some(m) = self.view.members.get(candidate) {
                if m.status.is_reachable() {
                    return Some(m.identity.clone());
                }
            }
        }
        None
    }

    /// Every few rounds, one dead member still within retention gets a ping.
    pub fn reconnect_target(&self, rng: &mut impl Rng) -> Option<ProcessIdentity> {
        let every = u64::from(self.config.reconnect_every_rounds.max(1));
        if self.round % every != 0 {
            return None;
        }
        self.view
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Dead)
            .choose(rng)
            .map(|m| m.identity.clone())
    }

    /// Random alive relays for an indirect probe of `target`.
    pub fn relays(&self, target: &ProcessId, rng: &mut impl Rng) -> Vec<ProcessIdentity> {
        self.view
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Alive && &m.identity.id != target)
            .map(|m| m.identity.clone())
            .choose_multiple(rng, self.config.indirect_probes)
    }

    /// Up to `count` random alive peers.
    pub fn random_alive(&self, count: usize, rng: &mut impl Rng) -> Vec<ProcessIdentity> {
        self.view
            .alive_peers()
            .choose_multiple(rng, count)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn retransmit_limit(&self) -> u32 {
        gossip::retransmit_limit(
            self.config.retransmit_multiplier,
            self.view.members.len() + 1,
        )
    }

    /// Outgoing payload. The belief about `target` always rides along so a
    /// wrongly suspected target can refute.
    pub fn payload_for(&mut self, target: Option<&ProcessId>) -> GossipPayload {
        let belief = target
            .and_then(|id| self.view.members.get(id))
            .map(|m| MemberDelta::new(m.identity.clone(), m.status, m.incarnation));
        let budget = self
            .config
            .max_gossip_deltas
            .saturating_sub(usize::from(belief.is_some()));
        let limit = self.retransmit_limit();
        let queued = self.outbox.take(budget, limit);
        let has_belief = belief.is_some();
        let mut membership: Vec<MemberDelta> = belief.into_iter().collect();
        membership.extend(
            queued
                .into_iter()
                .filter(|d| !(has_belief && Some(&d.identity.id) == target)),
        );

        GossipPayload {
            sender: self.view.local.clone(),
            incarnation: self.view.incarnation,
            membership,
            registry: Vec::new(),
        }
    }

    /// Every known member; sent to processes seen for the first time.
    #[must_use]
    pub fn full_payload(&self) -> GossipPayload {
        let mut membership: Vec<MemberDelta> = self
            .view
            .members
            .values()
            .map(|m| MemberDelta::new(m.identity.clone(), m.status, m.incarnation))
            .collect();
        if self.has_left() {
            membership.push(MemberDelta::new(
                self.view.local.clone(),
                MemberStatus::Left,
                self.view.incarnation,
            ));
        }
        GossipPayload {
            sender: self.view.local.clone(),
            incarnation: self.view.incarnation,
            membership,
            registry: Vec::new(),
        }
    }

    /// Mark the local process as left and queue the announcement.
    pub fn leave(&mut self) -> MemberDelta {
        self.view.incarnation = self.view.incarnation.saturating_add(1);
        self.view.local_status = MemberStatus::Left;
        let delta = MemberDelta::new(
            self.view.local.clone(),
            MemberStatus::Left,
            self.view.incarnation,
        );
        self.outbox.push(self.view.local.id.clone(), delta.clone());
        delta
    }
}
