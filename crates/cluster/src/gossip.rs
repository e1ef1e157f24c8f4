//! Gossip payloads and piggyback bookkeeping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use murmur_core::{MemberStatus, ProcessIdentity};

use crate::registry::RegistrationEntry;

/// One claim about a process's liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDelta {
    pub identity: ProcessIdentity,
    pub status: MemberStatus,
    pub incarnation: u64,
}

impl MemberDelta {
    #[must_use]
    pub const fn new(identity: ProcessIdentity, status: MemberStatus, incarnation: u64) -> Self {
        Self {
            identity,
            status,
            incarnation,
        }
    }
}

/// Everything a ping, ping-req, or ack carries.
///
/// `sender` and `incarnation` double as the sender's own `Alive` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipPayload {
    pub sender: ProcessIdentity,
    pub incarnation: u64,
    #[serde(default)]
    pub membership: Vec<MemberDelta>,
    #[serde(default)]
    pub registry: Vec<RegistrationEntry>,
}

impl GossipPayload {
    /// A payload carrying only the sender's own claim.
    #[must_use]
    pub const fn bare(sender: ProcessIdentity, incarnation: u64) -> Self {
        Self {
            sender,
            incarnation,
            membership: Vec::new(),
            registry: Vec::new(),
        }
    }
}

/// Number of times each delta is piggybacked in a cluster of `cluster_size`.
#[must_use]
pub fn retransmit_limit(multiplier: u32, cluster_size: usize) -> u32 {
    let rounds = usize::BITS - cluster_size.leading_zeros();
    multiplier.saturating_mul(rounds).max(1)
}

/// Deltas waiting to be piggybacked, each sent a bounded number of times.
///
/// A newer delta for the same key replaces the old one and restarts its count.
#[derive(Debug, Clone)]
pub struct TransmitQueue<K: Ord + Clone, T: Clone> {
    items: BTreeMap<K, (T, u32)>,
}

impl<K: Ord + Clone, T: Clone> Default for TransmitQueue<K, T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, T: Clone> TransmitQueue<K, T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item` under `key`, replacing any older delta.
    pub fn push(&mut self, key: K, item: T) {
        self.items.insert(key, (item, 0));
    }

    /// Take up to `max` deltas, least-sent first.
    ///
    /// Deltas that reach `limit` transmissions are dropped afterwards.
    pub fn take(&mut self, max: usize, limit: u32) -> Vec<T> {
        let mut order: Vec<(u32, K)> = self
            .items
            .iter()
            .map(|(key, (_, sent))| (*sent, key.clone()))
            .collect();
        order.sort_by(|a, b| a.0.cmp(&b.0));

        let mut batch = Vec::with_capacity(max.min(order.len()));
        for (_, key) in order.into_iter().take(max) {
            let exhausted = match self.items.get_mut(&key) {
                Some((item, sent)) => {
                    batch.push(item.clone());
                    *sent = sent.saturating_add(1);
                    *sent >= limit
                }
                None => false,
            };
            if exhausted {
                self.items.remove(&key);
            }
        }
        batch
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_grows_logarithmically() {
        assert_eq!(retransmit_limit(3, 0), 1);
        assert_eq!(retransmit_limit(3, 1), 3);
        assert_eq!(retransmit_limit(3, 5), 9);
        assert_eq!(retransmit_limit(3, 100), 21);
    }

    #[test]
    fn take_is_bounded_and_prefers_fresh_deltas() {
        let mut queue = TransmitQueue::new();
        queue.push("a", 1);
        queue.push("b", 2);
        assert_eq!(queue.take(1, 3), vec![1]);
        // "b" has been sent fewer times now.
        assert_eq!(queue.take(1, 3), vec![2]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn deltas_expire_after_limit() {
        let mut queue = TransmitQueue::new();
        queue.push("a", 1);
        assert_eq!(queue.take(4, 2), vec![1]);
        assert_eq!(queue.take(4, 2), vec![1]);
        assert!(queue.take(4, 2).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn push_replaces_and_resets() {
        let mut queue = TransmitQueue::new();
        queue.push("a", 1);
        let _ = queue.take(1, 2);
        queue.push("a", 5);
        assert_eq!(queue.take(1, 2), vec![5]);
        assert_eq!(queue.take(1, 2), vec![5]);
        assert!(queue.is_empty());
    }
}
