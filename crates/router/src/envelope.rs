//! Message envelope and its JSON wire form.

use std::fmt;

use serde::{Deserialize, Serialize};

use murmur_core::{
    AgentId, ConversationId, CorrelationId, DeliveryGuarantee, Error, MessageId, Result,
};

/// Envelope content as JSON.
pub type Content = serde_json::Value;

/// Communicative act of a message.
///
/// The FIPA core set plus `Heartbeat` and `Capability`. Anything else decodes
/// as `Unknown` so newer peers do not break older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Performative {
    Request,
    Inform,
    QueryIf,
    QueryRef,
    Propose,
    AcceptProposal,
    RejectProposal,
    Agree,
    Refuse,
    Failure,
    NotUnderstood,
    Heartbeat,
    Capability,
    #[serde(other)]
    Unknown,
}

impl Performative {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Inform => "inform",
            Self::QueryIf => "query_if",
            Self::QueryRef => "query_ref",
            Self::Propose => "propose",
            Self::AcceptProposal => "accept_proposal",
            Self::RejectProposal => "reject_proposal",
            Self::Agree => "agree",
            Self::Refuse => "refuse",
            Self::Failure => "failure",
            Self::NotUnderstood => "not_understood",
            Self::Heartbeat => "heartbeat",
            Self::Capability => "capability",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Performative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Informational; ordering stays per conversation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A message between two agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    /// Position within the conversation, starting at 0.
    pub sequence: u64,
    pub sender: AgentId,
    pub destination: AgentId,
    pub performative: Performative,
    pub content: Content,
    #[serde(default)]
    pub delivery_guarantee: DeliveryGuarantee,
    /// Per-sender counter; required for exactly-once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub priority: Priority,
}

impl Envelope {
    /// New at-least-once envelope with a fresh message id.
    #[must_use]
    pub fn new(
        sender: impl Into<AgentId>,
        destination: impl Into<AgentId>,
        conversation_id: impl Into<ConversationId>,
        sequence: u64,
        performative: Performative,
        content: Content,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            conversation_id: conversation_id.into(),
            sequence,
            sender: sender.into(),
            destination: destination.into(),
            performative,
            content,
            delivery_guarantee: DeliveryGuarantee::default(),
            sender_sequence: None,
            reply_with: None,
            in_reply_to: None,
            correlation_id: None,
            priority: Priority::default(),
        }
    }

    #[must_use]
    pub const fn with_guarantee(mut self, guarantee: DeliveryGuarantee) -> Self {
        self.delivery_guarantee = guarantee;
        self
    }

    #[must_use]
    pub const fn with_sender_sequence(mut self, sequence: u64) -> Self {
        self.sender_sequence = Some(sequence);
        self
    }

    #[must_use]
    pub fn with_reply_with(mut self, reply_with: impl Into<String>) -> Self {
        self.reply_with = Some(reply_with.into());
        self
    }

    #[must_use]
    pub fn in_reply_to(mut self, in_reply_to: impl Into<String>) -> Self {
        self.in_reply_to = Some(in_reply_to.into());
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Correlation id for events about this message.
    #[must_use]
    pub fn correlation(&self) -> CorrelationId {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| CorrelationId::from(&self.message_id))
    }

    /// Size of the serialized content in bytes.
    #[must_use]
    pub fn content_len(&self) -> usize {
        serde_json::to_vec(&self.content).map_or(0, |bytes| bytes.len())
    }

    /// Check the envelope before routing.
    ///
    /// # Errors
    ///
    /// `Error::InvalidEnvelope` for empty ids, oversized content, or an
    /// exactly-once message without a sender sequence.
    pub fn validate(&self, max_content_bytes: usize) -> Result<()> {
        if self.message_id.as_str().is_empty() {
            return Err(Error::invalid_envelope("empty message id"));
        }
        if self.sender.as_str().is_empty() || self.destination.as_str().is_empty() {
            return Err(Error::invalid_envelope("empty sender or destination"));
        }
        if self.conversation_id.as_str().is_empty() {
            return Err(Error::invalid_envelope("empty conversation id"));
        }
        if self.sequence == u64::MAX || self.sender_sequence == Some(u64::MAX) {
            return Err(Error::invalid_envelope("sequence out of range"));
        }
        let size = self.content_len();
        if size > max_content_bytes {
            return Err(Error::invalid_envelope(format!(
                "content of {size} bytes exceeds the {max_content_bytes} byte limit"
            )));
        }
        if self.delivery_guarantee == DeliveryGuarantee::ExactlyOnce
            && self.sender_sequence.is_none()
        {
            return Err(Error::invalid_envelope(
                "exactly-once delivery requires a sender sequence",
            ));
        }
        Ok(())
    }

    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// `Error::Codec` if the content cannot be serialized.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::codec(e.to_string()))
    }

    /// Decode from JSON. Unknown fields are ignored.
    ///
    /// # Errors
    ///
    /// `Error::Codec` on malformed input or missing required fields.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::codec(e.to_string()))
    }
}
