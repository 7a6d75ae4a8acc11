//! Conflict classes: exclusive resource keys and batch partitioning.
//!
//! A tool declares the resource keys it acquires exclusively (derived from
//! its arguments). Two calls conflict when their key sets intersect; the
//! orchestrator never runs conflicting calls concurrently. These keys are
//! the only locking mechanism in the system.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An exclusive resource key, e.g. `fs:src/lib.rs` or `browser:tab-3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey(pub String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether two key sets conflict (intersect).
pub fn conflicts(a: &[ResourceKey], b: &[ResourceKey]) -> bool {
    a.iter().any(|k| b.contains(k))
}

/// Partition a batch into waves of mutually conflict-free calls.
///
/// Greedy in submission order: each call joins the first wave it does not
/// conflict with, so independent calls run together and only genuinely
/// conflicting calls serialize. Returns waves of indices into the input.
pub fn partition(key_sets: &[Vec<ResourceKey>]) -> Vec<Vec<usize>> {
    let mut waves: Vec<(Vec<usize>, HashSet<ResourceKey>)> = Vec::new();

    for (index, keys) in key_sets.iter().enumerate() {
        let slot = waves
            .iter_mut()
            .find(|(_, held)| !keys.iter().any(|k| held.contains(k)));
        match slot {
            Some((members, held)) => {
                members.push(index);
                held.extend(keys.iter().cloned());
            }
            None => {
                waves.push((vec![index], keys.iter().cloned().collect()));
            }
        }
    }

    waves.into_iter().map(|(members, _)| members).collect()
}
