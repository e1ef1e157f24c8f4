//! Immutable membership snapshots and change notifications.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tokio::time::Instant;

use murmur_core::{MemberStatus, ProcessId, ProcessIdentity};

/// What the local process believes about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub identity: ProcessIdentity,
    pub status: MemberStatus,
    pub incarnation: u64,
    pub changed_at: Instant,
}

/// The local view of the cluster, published after every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipView {
    pub local: ProcessIdentity,
    pub local_status: MemberStatus,
    pub incarnation: u64,
    pub members: BTreeMap<ProcessId, Member>,
}

impl MembershipView {
    #[must_use]
    pub const fn new(local: ProcessIdentity, incarnation: u64) -> Self {
        Self {
            local,
            local_status: MemberStatus::Alive,
            incarnation,
            members: BTreeMap::new(),
        }
    }

    /// Alive or suspected; the local process counts unless it has left.
    #[must_use]
    pub fn is_alive(&self, process: &ProcessId) -> bool {
        if process == &self.local.id {
            return self.local_status == MemberStatus::Alive;
        }
        self.members
            .get(process)
            .is_some_and(|m| m.status.is_reachable())
    }

    /// Every reachable process, the local one included.
    #[must_use]
    pub fn alive_processes(&self) -> BTreeSet<ProcessIdentity> {
        let peers = self.alive_peers().into_iter();
        if self.local_status == MemberStatus::Alive {
            peers.chain(std::iter::once(self.local.clone())).collect()
        } else {
            peers.collect()
        }
    }

    /// Reachable peers, the local process excluded.
    #[must_use]
    pub fn alive_peers(&self) -> Vec<ProcessIdentity> {
        self.members
            .values()
            .filter(|m| m.status.is_reachable())
            .map(|m| m.identity.clone())
            .collect()
    }

    /// Size of the reachable set, the local process included.
    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.status.is_reachable())
            .count()
            + usize::from(self.local_status == MemberStatus::Alive)
    }

    #[must_use]
    pub fn member(&self, process: &ProcessId) -> Option<&Member> {
        self.members.get(process)
    }

    /// Identity for any known process, the local one included.
    #[must_use]
    pub fn identity(&self, process: &ProcessId) -> Option<&ProcessIdentity> {
        if process == &self.local.id {
            Some(&self.local)
        } else {
            self.members.get(process).map(|m| &m.identity)
        }
    }
}

/// A change in the local view of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(ProcessIdentity),
    Suspected(ProcessIdentity),
    Failed(ProcessIdentity),
    Left(ProcessIdentity),
    Recovered(ProcessIdentity),
}

impl MembershipEvent {
    #[must_use]
    pub const fn identity(&self) -> &ProcessIdentity {
        match self {
            Self::Joined(p)
            | Self::Suspected(p)
            | Self::Failed(p)
            | Self::Left(p)
            | Self::Recovered(p) => p,
        }
    }

    /// Status the peer has after this event.
    #[must_use]
    pub const fn status(&self) -> MemberStatus {
        match self {
            Self::Joined(_) | Self::Recovered(_) => MemberStatus::Alive,
            Self::Suspected(_) => MemberStatus::Suspect,
            Self::Failed(_) => MemberStatus::Dead,
            Self::Left(_) => MemberStatus::Left,
        }
    }
}

impl fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Joined(_) => "joined",
            Self::Suspected(_) => "suspected",
            Self::Failed(_) => "failed",
            Self::Left(_) => "left",
            Self::Recovered(_) => "recovered",
        };
        write!(f, "{} {kind}", self.identity())
    }
}
