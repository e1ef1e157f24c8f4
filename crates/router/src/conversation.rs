//! Per-conversation ordering at the point of local delivery.
//!
//! A conversation starts at sequence 0 on its first message. Arrivals ahead of
//! the expected sequence wait in a bounded buffer; the in-order run is
//! released as soon as the gap closes. Ordering holds within a conversation
//! only.
//!
//! Lifecycle: `active -> (idle timeout | close) -> closed -> (idle timeout) ->
//! gone`. The closed marker stops late messages from reopening a finished
//! conversation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::time::Instant;
use tracing::debug;

use murmur_core::{AgentId, ConversationConfig, ConversationId, Error, Result};

use crate::envelope::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConversationState {
    pub conversation_id: ConversationId,
    pub next_expected: u64,
    pub buffered: BTreeMap<u64, Envelope>,
    pub status: ConversationStatus,
    pub participants: BTreeSet<AgentId>,
    pub last_activity: Instant,
    pub delivered: u64,
}

impl ConversationState {
    fn new(conversation_id: ConversationId, now: Instant) -> Self {
        Self {
            conversation_id,
            next_expected: 0,
            buffered: BTreeMap::new(),
            status: ConversationStatus::Active,
            participants: BTreeSet::new(),
            last_activity: now,
            delivered: 0,
        }
    }

    fn close(&mut self, now: Instant) {
        self.status = ConversationStatus::Closed;
        self.buffered.clear();
        self.last_activity = now;
    }
}

/// What happened to an arriving message.
#[derive(Debug, Clone, PartialEq)]
pub enum Arrival {
    /// Deliver these now, in order. Starts with the arriving message.
    Ready(Vec<Envelope>),
    /// Held until the gap before it closes.
    Buffered,
    /// Already delivered or already buffered; discard.
    Duplicate,
}

/// Counts reported by [`ConversationManager::expire_inactive`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expiry {
    pub closed: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversationStats {
    pub active: usize,
    pub closed: usize,
    pub buffered: usize,
    pub delivered: u64,
}

/// Ordering state for every conversation seen by this process.
#[derive(Debug)]
pub struct ConversationManager {
    config: ConversationConfig,
    conversations: HashMap<ConversationId, ConversationState>,
}

impl ConversationManager {
    #[must_use]
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            config,
            conversations: HashMap::new(),
        }
    }

    /// Admit an arriving message.
    ///
    /// # Errors
    ///
    /// - `Error::ConversationClosed` if the conversation was closed.
    /// - `Error::ConversationOverflow` if it must be buffered and the buffer
    ///   is full; the message is dropped.
    pub fn accept(&mut self, envelope: Envelope, now: Instant) -> Result<Arrival> {
        let bound = self.config.buffer_bound;
        let state = self
            .conversations
            .entry(envelope.conversation_id.clone())
            .or_insert_with(|| ConversationState::new(envelope.conversation_id.clone(), now));

        if state.status == ConversationStatus::Closed {
            return Err(Error::ConversationClosed {
                conversation_id: state.conversation_id.to_string(),
            });
        }
        state.last_activity = now;
        state.participants.insert(envelope.sender.clone());
        state.participants.insert(envelope.destination.clone());

        let sequence = envelope.sequence;
        let Some(after) = sequence.checked_add(1) else {
            return Err(Error::invalid_envelope("conversation sequence out of range"));
        };
        if sequence < state.next_expected || state.buffered.contains_key(&sequence) {
            debug!(
                conversation_id = %state.conversation_id,
                sequence,
                next_expected = state.next_expected,
                "duplicate conversation message"
            );
            return Ok(Arrival::Duplicate);
        }

        if sequence > state.next_expected {
            if state.buffered.len() >= bound {
                return Err(Error::ConversationOverflow {
                    conversation_id: state.conversation_id.to_string(),
                    capacity: bound,
                });
            }
            state.buffered.insert(sequence, envelope);
            return Ok(Arrival::Buffered);
        }

        let mut ready = vec![envelope];
        state.next_expected = after;
        while let Some(next) = state.buffered.remove(&state.next_expected) {
            ready.push(next);
            state.next_expected = state.next_expected.saturating_add(1);
        }
        state.delivered += ready.len() as u64;
        Ok(Arrival::Ready(ready))
    }

    /// Undo part of a released run whose hand-off stopped at `failed`.
    ///
    /// The conversation expects `failed` again and the rest of the run goes
    /// back into the buffer, so a resend of `failed` releases it all.
    pub fn rewind(&mut self, failed: &Envelope, rest: Vec<Envelope>) {
        let Some(state) = self.conversations.get_mut(&failed.conversation_id) else {
            return;
        };
        let undone = 1 + rest.len() as u64;
        state.next_expected = failed.sequence;
        state.delivered = state.delivered.saturating_sub(undone);
        for envelope in rest {
            state.buffered.insert(envelope.sequence, envelope);
        }
        debug!(
            conversation_id = %state.conversation_id,
            sequence = failed.sequence,
            rebuffered = undone - 1,
            "conversation rewound after failed hand-off"
        );
    }

    /// Close a conversation. Returns `false` if it was unknown or already
    /// closed. An unknown conversation is recorded as closed.
    pub fn close(&mut self, conversation_id: &ConversationId, now: Instant) -> bool {
        match self.conversations.get_mut(conversation_id) {
            Some(state) if state.status == ConversationStatus::Active => {
                state.close(now);
                true
            }
            Some(_) => false,
            None => {
                let mut state = ConversationState::new(conversation_id.clone(), now);
                state.close(now);
                self.conversations.insert(conversation_id.clone(), state);
                false
            }
        }
    }

    /// Close idle conversations and forget closed ones past the timeout.
    pub fn expire_inactive(&mut self, now: Instant) -> Expiry {
        let timeout = self.config.inactivity_timeout();
        let mut expiry = Expiry::default();
        self.conversations.retain(|_, state| {
            if now.saturating_duration_since(state.last_activity) < timeout {
                return true;
            }
            match state.status {
                ConversationStatus::Active => {
                    state.close(now);
                    expiry.closed += 1;
                    true
                }
                ConversationStatus::Closed => {
                    expiry.removed += 1;
                    false
                }
            }
        });
        expiry
    }

    #[must_use]
    pub fn get(&self, conversation_id: &ConversationId) -> Option<&ConversationState> {
        self.conversations.get(conversation_id)
    }

    #[must_use]
    pub fn participants(&self, conversation_id: &ConversationId) -> BTreeSet<AgentId> {
        self.get(conversation_id)
            .map(|s| s.participants.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> ConversationStats {
        self.conversations
            .values()
            .fold(ConversationStats::default(), |mut stats, state| {
                match state.status {
                    ConversationStatus::Active => stats.active += 1,
                    ConversationStatus::Closed => stats.closed += 1,
                }
                stats.buffered += state.buffered.len();
                stats.delivered += state.delivered;
                stats
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use std::time::Duration;

    use proptest::prelude::*;
    use serde_json::json;

    use crate::envelope::Performative;

    fn config(bound: usize) -> ConversationConfig {
        ConversationConfig {
            buffer_bound: bound,
            inactivity_timeout_ms: 1_000,
        }
    }

    fn msg(sequence: u64) -> Envelope {
        Envelope::new(
            "alice",
            "bob",
            "c-1",
            sequence,
            Performative::Inform,
            json!(sequence),
        )
    }

    fn sequences(arrival: &Arrival) -> Vec<u64> {
        match arrival {
            Arrival::Ready(batch) => batch.iter().map(|e| e.sequence).collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn gap_is_buffered_then_released_in_order() {
        let mut manager = ConversationManager::new(config(8));
        let now = Instant::now();

        assert_eq!(manager.accept(msg(2), now).unwrap(), Arrival::Buffered);
        assert_eq!(manager.accept(msg(1), now).unwrap(), Arrival::Buffered);
        let released = manager.accept(msg(0), now).unwrap();
        assert_eq!(sequences(&released), vec![0, 1, 2]);
        assert_eq!(manager.get(&"c-1".into()).unwrap().next_expected, 3);
    }

    #[test]
    fn late_and_repeated_messages_are_duplicates() {
        let mut manager = ConversationManager::new(config(8));
        let now = Instant::now();
        manager.accept(msg(0), now).unwrap();
        manager.accept(msg(3), now).unwrap();

        assert_eq!(manager.accept(msg(0), now).unwrap(), Arrival::Duplicate);
        assert_eq!(manager.accept(msg(3), now).unwrap(), Arrival::Duplicate);
    }

    #[test]
    fn full_buffer_overflows() {
        let mut manager = ConversationManager::new(config(2));
        let now = Instant::now();
        manager.accept(msg(1), now).unwrap();
        manager.accept(msg(2), now).unwrap();

        let err = manager.accept(msg(3), now).unwrap_err();
        assert!(matches!(err, Error::ConversationOverflow { capacity: 2, .. }));
        // The in-order message still gets through and drains the buffer.
        assert_eq!(sequences(&manager.accept(msg(0), now).unwrap()), vec![0, 1, 2]);
    }

    #[test]
    fn closed_conversation_rejects_messages() {
        let mut manager = ConversationManager::new(config(8));
        let now = Instant::now();
        manager.accept(msg(0), now).unwrap();
        assert!(manager.close(&"c-1".into(), now));

        let err = manager.accept(msg(1), now).unwrap_err();
        assert!(matches!(err, Error::ConversationClosed { .. }));
    }

    #[test]
    fn idle_conversations_close_then_disappear() {
        let mut manager = ConversationManager::new(config(8));
        let start = Instant::now();
        manager.accept(msg(0), start).unwrap();

        let later = start + Duration::from_millis(1_500);
        assert_eq!(
            manager.expire_inactive(later),
            Expiry {
                closed: 1,
                removed: 0
            }
        );
        assert!(manager.accept(msg(1), later).is_err());

        let much_later = later + Duration::from_millis(1_500);
        assert_eq!(manager.expire_inactive(much_later).removed, 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn participants_and_stats() {
        let mut manager = ConversationManager::new(config(8));
        let now = Instant::now();
        manager.accept(msg(0), now).unwrap();
        manager.accept(msg(5), now).unwrap();

        let participants = manager.participants(&"c-1".into());
        assert!(participants.contains(&AgentId::new("alice")));
        assert!(participants.contains(&AgentId::new("bob")));

        let stats = manager.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.buffered, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn rewind_expects_the_failed_message_again() {
        let mut manager = ConversationManager::new(config(8));
        let now = Instant::now();
        manager.accept(msg(1), now).unwrap();
        manager.accept(msg(2), now).unwrap();
        let Arrival::Ready(run) = manager.accept(msg(0), now).unwrap() else {
            panic!("expected a released run");
        };

        // 0 was handed over, 1 was not.
        let mut run = run.into_iter().skip(1);
        let failed = run.next().unwrap();
        manager.rewind(&failed, run.collect());

        let state = manager.get(&"c-1".into()).unwrap();
        assert_eq!(state.next_expected, 1);
        assert_eq!(state.buffered.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(state.delivered, 1);
        assert_eq!(sequences(&manager.accept(msg(1), now).unwrap()), vec![1, 2]);
    }

    #[test]
    fn last_representable_sequence_is_rejected() {
        let mut manager = ConversationManager::new(config(8));
        let err = manager.accept(msg(u64::MAX), Instant::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidEnvelope { .. }));
    }

    proptest! {
        #[test]
        fn any_arrival_order_delivers_strictly_increasing(order in Just((0u64..12).collect::<Vec<_>>()).prop_shuffle()) {
            let mut manager = ConversationManager::new(config(16));
            let now = Instant::now();
            let mut delivered = Vec::new();
            for sequence in order {
                if let Arrival::Ready(batch) = manager.accept(msg(sequence), now).unwrap() {
                    delivered.extend(batch.into_iter().map(|e| e.sequence));
                }
            }
            prop_assert_eq!(delivered, (0u64..12).collect::<Vec<_>>());
        }
    }
}
