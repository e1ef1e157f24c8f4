//! # murmur
//!
//! Gossip membership, an eventually consistent agent registry, and
//! conversation-ordered message routing between agents spread over a set of
//! processes.
//!
//! This crate wires the workspace crates into a runnable [`Node`] and
//! provides the wire protocol ([`net`]) plus an in-process network for tests
//! ([`loopback`]).

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod loopback;
pub mod net;
pub mod node;
pub mod telemetry;

pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use net::{Frame, FrameHandler, Reply, TcpTransport, serve};
pub use node::{Node, default_bus, store_for};

pub use murmur_cluster;
pub use murmur_core;
pub use murmur_events;
pub use murmur_router;
