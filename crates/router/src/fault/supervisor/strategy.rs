//! Restart strategies.
//!
//! - `OneForOne`: restart only the failed child
//! - `OneForAll`: restart every child of the supervisor
//! - `RestForOne`: restart the failed child and the siblings registered after it

use std::fmt;

use serde::{Deserialize, Serialize};

use super::tree::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    #[default]
    OneForOne,
    OneForAll,
    RestForOne,
}

impl RestartStrategy {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OneForOne => "one_for_one",
            Self::OneForAll => "one_for_all",
            Self::RestForOne => "rest_for_one",
        }
    }

    /// Children to restart, in registration order, when `failed` fails.
    /// Empty if `failed` is not among `children`.
    #[must_use]
    pub fn select(self, children: &[NodeId], failed: NodeId) -> Vec<NodeId> {
        let Some(position) = children.iter().position(|c| *c == failed) else {
            return Vec::new();
        };
        match self {
            Self::OneForOne => vec![failed],
            Self::OneForAll => children.to_vec(),
            Self::RestForOne => children[position..].to_vec(),
        }
    }
}

impl fmt::Display for RestartStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
