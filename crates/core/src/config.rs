//! Node configuration.
//!
//! Durations are carried as integer milliseconds so TOML stays readable; each
//! section exposes `Duration` accessors. Every section has `#[serde(default)]`
//! so a config file only needs to name what it changes.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable process id; generated at startup when absent.
    pub id: Option<String>,
    /// Address this process listens on for gossip and forwarding.
    pub listen: SocketAddr,
    /// Seed addresses contacted on join.
    pub seeds: Vec<SocketAddr>,
    pub membership: MembershipConfig,
    pub registry: RegistryConfig,
    pub partition: PartitionConfig,
    pub conversation: ConversationConfig,
    pub delivery: DeliveryConfig,
    pub circuit: CircuitConfig,
    pub supervisor: SupervisorConfig,
    pub store: StoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            listen: SocketAddr::from(([127, 0, 0, 1], 7946)),
            seeds: Vec::new(),
            membership: MembershipConfig::default(),
            registry: RegistryConfig::default(),
            partition: PartitionConfig::default(),
            conversation: ConversationConfig::default(),
            delivery: DeliveryConfig::default(),
            circuit: CircuitConfig::default(),
            supervisor: SupervisorConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Short timeouts for tests running whole clusters in one process.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            membership: MembershipConfig {
                gossip_interval_ms: 20,
                probe_timeout_ms: 15,
                indirect_timeout_ms: 30,
                suspicion_timeout_ms: 120,
                dead_retention_ms: 5_000,
                reconnect_every_rounds: 2,
                ..MembershipConfig::default()
            },
            conversation: ConversationConfig {
                buffer_bound: 8,
                inactivity_timeout_ms: 5_000,
            },
            delivery: DeliveryConfig {
                max_attempts: 4,
                retry_base_ms: 10,
                max_backoff_ms: 80,
                ack_timeout_ms: 100,
                discovery_timeout_ms: 100,
                ..DeliveryConfig::default()
            },
            circuit: CircuitConfig {
                failure_threshold: 3,
                cooldown_ms: 50,
            },
            supervisor: SupervisorConfig {
                max_restarts: 3,
                restart_window_ms: 1_000,
            },
            store: StoreConfig {
                path: None,
                snapshot_interval_ms: 100,
                maintenance_interval_ms: 50,
            },
            ..Self::default()
        }
    }

    /// Parse a TOML document and validate it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the document does not parse or fails validation.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| Error::config("toml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read, or `Error::Config`
    /// if it is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let m = &self.membership;
        ensure(m.gossip_interval_ms > 0, "membership.gossip_interval_ms", "must be > 0")?;
        ensure(m.probe_timeout_ms > 0, "membership.probe_timeout_ms", "must be > 0")?;
        ensure(
            m.suspicion_timeout_ms >= m.probe_timeout_ms,
            "membership.suspicion_timeout_ms",
            "must be >= probe_timeout_ms",
        )?;
        ensure(
            m.max_gossip_deltas > 0,
            "membership.max_gossip_deltas",
            "must be > 0",
        )?;
        ensure(self.partition.quorum > 0, "partition.quorum", "must be > 0")?;
        ensure(
            self.conversation.buffer_bound > 0,
            "conversation.buffer_bound",
            "must be > 0",
        )?;
        let d = &self.delivery;
        ensure(d.max_attempts > 0, "delivery.max_attempts", "must be > 0")?;
        ensure(
            d.backoff_factor >= 1.0,
            "delivery.backoff_factor",
            "must be >= 1.0",
        )?;
        ensure(d.dedup_capacity > 0, "delivery.dedup_capacity", "must be > 0")?;
        ensure(
            self.circuit.failure_threshold > 0,
            "circuit.failure_threshold",
            "must be > 0",
        )?;
        ensure(
            self.supervisor.max_restarts > 0,
            "supervisor.max_restarts",
            "must be > 0",
        )?;
        Ok(())
    }
}

fn ensure(condition: bool, field: &str, reason: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::config(field, reason))
    }
}

/// Gossip membership settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Interval between probe rounds.
    pub gossip_interval_ms: u64,
    /// Wait for a direct ack before asking relays.
    pub probe_timeout_ms: u64,
    /// Wait for relayed acks before suspecting.
    pub indirect_timeout_ms: u64,
    /// Number of relays asked to probe indirectly.
    pub indirect_probes: usize,
    /// Suspect → dead after this long without refutation.
    pub suspicion_timeout_ms: u64,
    /// Dead and left members are kept this long before being purged.
    pub dead_retention_ms: u64,
    /// Membership deltas piggybacked per payload.
    pub max_gossip_deltas: usize,
    /// Registry entries piggybacked per payload.
    pub max_registry_deltas: usize,
    /// Each delta is retransmitted `multiplier * ceil(log2(n + 1))` times.
    pub retransmit_multiplier: u32,
    /// Every this many rounds, one dead member gets a reconnect ping.
    pub reconnect_every_rounds: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 200,
            probe_timeout_ms: 100,
            indirect_timeout_ms: 200,
            indirect_probes: 3,
            suspicion_timeout_ms: 1_000,
            dead_retention_ms: 30_000,
            max_gossip_deltas: 16,
            max_registry_deltas: 16,
            retransmit_multiplier: 3,
            reconnect_every_rounds: 5,
        }
    }
}

impl MembershipConfig {
    #[must_use]
    pub const fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub const fn indirect_timeout(&self) -> Duration {
        Duration::from_millis(self.indirect_timeout_ms)
    }

    #[must_use]
    pub const fn suspicion_timeout(&self) -> Duration {
        Duration::from_millis(self.suspicion_timeout_ms)
    }

    #[must_use]
    pub const fn dead_retention(&self) -> Duration {
        Duration::from_millis(self.dead_retention_ms)
    }
}

/// Registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Tombstones older than this are garbage collected.
    pub tombstone_retention_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tombstone_retention_ms: 60_000,
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub const fn tombstone_retention(&self) -> Duration {
        Duration::from_millis(self.tombstone_retention_ms)
    }
}

/// Partition classification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Alive processes (self included) needed for `Majority`.
    pub quorum: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self { quorum: 1 }
    }
}

/// Conversation ordering settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Out-of-order messages buffered per conversation.
    pub buffer_bound: usize,
    /// Idle conversations are dropped after this long.
    pub inactivity_timeout_ms: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            buffer_bound: 64,
            inactivity_timeout_ms: 600_000,
        }
    }
}

impl ConversationConfig {
    #[must_use]
    pub const fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

/// Delivery guarantee and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts for acknowledged guarantees, first try included.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub retry_base_ms: u64,
    /// Multiplier applied per further attempt.
    pub backoff_factor: f64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
    /// Bound on waiting for a remote acknowledgement.
    pub ack_timeout_ms: u64,
    /// Bound on waiting for location discovery.
    pub discovery_timeout_ms: u64,
    /// Receiver-side dedup cache size.
    pub dedup_capacity: u64,
    /// Receiver-side dedup entry lifetime.
    pub dedup_ttl_ms: u64,
    /// Largest accepted envelope content, in bytes of JSON.
    pub max_content_bytes: usize,
    /// Messages kept after their guarantee policy gave up.
    pub dead_letter_capacity: usize,
    /// Acknowledged sends held while in a minority partition.
    pub held_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_ms: 100,
            backoff_factor: 2.0,
            max_backoff_ms: 5_000,
            ack_timeout_ms: 1_000,
            discovery_timeout_ms: 500,
            dedup_capacity: 10_000,
            dedup_ttl_ms: 3_600_000,
            max_content_bytes: 1_048_576,
            dead_letter_capacity: 1_000,
            held_capacity: 10_000,
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    #[must_use]
    pub const fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    #[must_use]
    pub const fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed.
    pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitConfig {
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Supervisor restart-rate limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Restarts allowed per entity within the window.
    pub max_restarts: u32,
    /// Sliding window for counting restarts.
    pub restart_window_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_window_ms: 60_000,
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    pub const fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }
}

/// Local state store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Snapshot file; in-memory only when absent.
    pub path: Option<PathBuf>,
    /// Interval between snapshots.
    pub snapshot_interval_ms: u64,
    /// Interval between GC passes (tombstones, conversations, dedup).
    pub maintenance_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            snapshot_interval_ms: 5_000,
            maintenance_interval_ms: 1_000,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(NodeConfig::default().validate().is_ok());
        assert!(NodeConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            id = "node-a"
            listen = "127.0.0.1:7000"
            seeds = ["127.0.0.1:7001"]

            [partition]
            quorum = 3

            [circuit]
            failure_threshold = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.id.as_deref(), Some("node-a"));
        assert_eq!(config.partition.quorum, 3);
        assert_eq!(config.circuit.failure_threshold, 7);
        assert_eq!(config.circuit.cooldown_ms, 30_000);
        assert_eq!(config.seeds.len(), 1);
        assert_eq!(config.membership, MembershipConfig::default());
    }

    #[test]
    fn zero_quorum_is_rejected() {
        let err = NodeConfig::from_toml_str("[partition]\nquorum = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config { ref field, .. } if field == "partition.quorum"));
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[conversation]\nbuffer_bound = 4\n").unwrap();
        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.conversation.buffer_bound, 4);
    }
}
