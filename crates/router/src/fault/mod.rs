//! Fault isolation: circuit breakers for remote destinations and supervisor
//! trees for local entities.

pub mod circuit_breaker;
pub mod supervisor;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakers, Transition};
pub use supervisor::{
    NodeId, NodeStatus, RestartReport, RestartStrategy, Supervised, SupervisorHandle,
    SupervisorTree,
};
