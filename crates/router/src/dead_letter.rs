//! Bounded queue of messages whose delivery policy was exhausted.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use murmur_core::MessageId;

use crate::delivery::FailureReason;
use crate::envelope::Envelope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub reason: FailureReason,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Oldest letters are dropped once the capacity is reached.
#[derive(Debug)]
pub struct DeadLetterQueue {
    letters: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn push(&self, envelope: Envelope, reason: FailureReason, attempts: u32) {
        let mut letters = self.letters.lock().await;
        if letters.len() >= self.capacity {
            if let Some(dropped) = letters.pop_front() {
                warn!(message_id = %dropped.envelope.message_id, "dead-letter queue full, dropping oldest");
            }
        }
        letters.push_back(DeadLetter {
            envelope,
            reason,
            attempts,
            dead_lettered_at: Utc::now(),
        });
    }

    pub async fn list(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.iter().cloned().collect()
    }

    /// Remove and return one letter, e.g. to re-route it by hand.
    pub async fn take(&self, message_id: &MessageId) -> Option<DeadLetter> {
        let mut letters = self.letters.lock().await;
        let position = letters
            .iter()
            .position(|l| &l.envelope.message_id == message_id)?;
        letters.remove(position)
    }

    pub async fn drain(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.letters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.letters.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    use crate::envelope::Performative;

    fn envelope(n: u64) -> Envelope {
        Envelope::new("a", "b", "c", n, Performative::Inform, json!(n))
    }

    #[tokio::test]
    async fn capacity_drops_oldest() {
        let queue = DeadLetterQueue::new(2);
        let first = envelope(0);
        let first_id = first.message_id.clone();
        queue.push(first, FailureReason::Timeout, 3).await;
        queue.push(envelope(1), FailureReason::Timeout, 3).await;
        queue.push(envelope(2), FailureReason::CircuitOpen, 3).await;

        assert_eq!(queue.len().await, 2);
        assert!(queue.take(&first_id).await.is_none());
        let sequences: Vec<u64> = queue.drain().await.iter().map(|l| l.envelope.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert!(queue.is_empty().await);
    }
}
