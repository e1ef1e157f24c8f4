//! Supervisor trees with rate-limited restarts and escalation.

mod handle;
mod strategy;
mod tree;

pub use handle::SupervisorHandle;
pub use strategy::RestartStrategy;
pub use tree::{NodeId, NodeStatus, RestartReport, Supervised, SupervisorTree};
