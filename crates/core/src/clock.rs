//! Vector clocks for ordering registry writes without wall-clock time.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ProcessId;

/// Causal relationship between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    /// Identical clocks.
    Equal,
    /// Neither clock dominates the other.
    Concurrent,
}

/// A vector clock keyed by process id.
///
/// Components absent from the map are zero. The derived `Ord` is a
/// lexicographic order over the entries; it is total but says nothing about
/// causality and exists only for deterministic tie-breaks.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ProcessId, u64>);

impl VectorClock {
    /// Create an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of one component.
    #[must_use]
    pub fn get(&self, process: &ProcessId) -> u64 {
        self.0.get(process).copied().unwrap_or(0)
    }

    /// Advance the component owned by `process`.
    pub fn increment(&mut self, process: &ProcessId) {
        let counter = self.0.entry(process.clone()).or_insert(0);
        *counter = counter.saturating_add(1);
    }

    /// Return a copy with `process` advanced.
    #[must_use]
    pub fn incremented(&self, process: &ProcessId) -> Self {
        let mut next = self.clone();
        next.increment(process);
        next
    }

    /// Raise the component owned by `process` to at least `value`.
    pub fn advance_to(&mut self, process: &ProcessId, value: u64) {
        if value > 0 {
            let counter = self.0.entry(process.clone()).or_insert(0);
            *counter = (*counter).max(value);
        }
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &Self) {
        for (process, &value) in other.0.iter().filter(|(_, v)| **v > 0) {
            let counter = self.0.entry(process.clone()).or_insert(0);
            *counter = (*counter).max(value);
        }
    }

    /// Pointwise maximum of two clocks.
    #[must_use]
    pub fn joined(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        joined.merge(other);
        joined
    }

    /// Compare two clocks causally.
    #[must_use]
    pub fn causality(&self, other: &Self) -> Causality {
        let mut less = false;
        let mut greater = false;

        for process in self.0.keys().chain(other.0.keys()) {
            match self.get(process).cmp(&other.get(process)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return Causality::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    /// `self` is causally after or equal to `other`.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(
            self.causality(other),
            Causality::After | Causality::Equal
        )
    }

    /// Sum of all components; a cheap progress indicator for logs.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// True when no component has advanced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (process, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{process}:{value}")?;
        }
        f.write_str("}")
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(entries: [(&str, u64); N]) -> Self {
        Self(
            entries
                .into_iter()
                .filter(|(_, value)| *value > 0)
                .map(|(process, value)| (ProcessId::new(process), value))
                .collect(),
        )
    }
}
