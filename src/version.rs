//! Version tracking for topology, attributes, and packed buffers.
//!
//! Every scope that can change — node topology, edge topology, each named
//! attribute, each named packed buffer — carries a monotonically increasing
//! counter. Everything else in the crate asks one question of this module:
//! "did this scope change since I last looked."
//!
//! # Counters
//!
//! Counters start at 1, advance on every mutation, and wrap back to 1 on
//! overflow — never 0, because 0 is the reserved "unknown" value. Counters
//! across scopes are independent; no cross-scope ordering is implied.
//!
//! When the engine exposes its own counters they are authoritative: native
//! code can bump them through direct writes that bypass this layer, so
//! [`VersionTracker::sync`] folds the native value in before every read.
//! Without native counters the tracker degenerates to pure local counting
//! and cannot observe native-side-only mutations — an accepted precision
//! loss, not a bug.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

use crate::engine::EntityKind;

/// Version counter value reserved for "unknown".
pub const VERSION_UNKNOWN: u64 = 0;

/// Identifies one independently versioned scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionScope {
    /// Structural changes to the id space of a kind (add/remove).
    Topology(EntityKind),
    /// Value changes to one named attribute.
    Attribute(EntityKind, String),
    /// Staleness of one named packed (dense) buffer. Bumped whenever the
    /// underlying attribute or the kind's topology changes.
    Packed(EntityKind, String),
}

impl VersionScope {
    pub fn attribute(kind: EntityKind, name: impl Into<String>) -> Self {
        VersionScope::Attribute(kind, name.into())
    }

    pub fn packed(kind: EntityKind, name: impl Into<String>) -> Self {
        VersionScope::Packed(kind, name.into())
    }
}

impl fmt::Display for VersionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionScope::Topology(kind) => write!(f, "{} topology", kind.label()),
            VersionScope::Attribute(kind, name) => {
                write!(f, "{} attribute \"{name}\"", kind.label())
            }
            VersionScope::Packed(kind, name) => {
                write!(f, "{} packed buffer \"{name}\"", kind.label())
            }
        }
    }
}

/// Per-scope monotonic version counters.
///
/// Counters are lazily created on first touch and live with the graph.
/// Thread-safe; shared across the runtime, cache, and sessions.
#[derive(Debug, Default)]
pub struct VersionTracker {
    counters: DashMap<VersionScope, u64>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Advances and returns the counter for `scope`.
    ///
    /// Called by every structural or attribute mutation. Wraps to 1,
    /// never 0.
    pub fn bump(&self, scope: VersionScope) -> u64 {
        let mut entry = self.counters.entry(scope.clone()).or_insert(1);
        *entry = next_version(*entry);
        let version = *entry;
        drop(entry);
        trace!(%scope, version, "bumped version");
        version
    }

    /// Returns the current counter for `scope`, 1 if never bumped.
    pub fn read(&self, scope: &VersionScope) -> u64 {
        self.counters.get(scope).map(|v| *v).unwrap_or(1)
    }

    /// Folds an authoritative native counter value in for `scope`.
    ///
    /// Native truth wins: the stored counter is replaced outright, not
    /// merged, since the engine may have bumped past the local value.
    pub fn sync(&self, scope: VersionScope, native: u64) {
        if native == VERSION_UNKNOWN {
            return;
        }
        self.counters.insert(scope, native);
    }

    /// Bumps every packed-buffer counter that depends on `kind`'s
    /// topology. A structural mutation invalidates all dense views of
    /// that kind at once.
    pub fn bump_packed_dependents(&self, kind: EntityKind) {
        let stale: Vec<VersionScope> = self
            .counters
            .iter()
            .filter_map(|entry| match entry.key() {
                VersionScope::Packed(k, _) if *k == kind => Some(entry.key().clone()),
                _ => None,
            })
            .collect();
        for scope in stale {
            self.bump(scope);
        }
    }

    /// Drops the counters for a removed attribute.
    pub fn forget_attribute(&self, kind: EntityKind, name: &str) {
        self.counters
            .remove(&VersionScope::attribute(kind, name));
        self.counters.remove(&VersionScope::packed(kind, name));
    }
}

fn next_version(current: u64) -> u64 {
    if current == u64::MAX {
        1
    } else {
        current + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_one() {
        let tracker = VersionTracker::new();
        let scope = VersionScope::Topology(EntityKind::Node);
        assert_eq!(tracker.read(&scope), 1);
    }

    #[test]
    fn bump_is_monotonic_per_scope() {
        let tracker = VersionTracker::new();
        let scope = VersionScope::Topology(EntityKind::Node);
        let v1 = tracker.bump(scope.clone());
        let v2 = tracker.bump(scope.clone());
        assert!(v2 > v1);
        assert_eq!(tracker.read(&scope), v2);
    }

    #[test]
    fn scopes_are_independent() {
        let tracker = VersionTracker::new();
        let nodes = VersionScope::Topology(EntityKind::Node);
        let edges = VersionScope::Topology(EntityKind::Edge);
        tracker.bump(nodes.clone());
        tracker.bump(nodes.clone());
        assert_eq!(tracker.read(&edges), 1);
    }

    #[test]
    fn wraps_to_one_never_zero() {
        assert_eq!(next_version(u64::MAX), 1);
        assert_eq!(next_version(1), 2);
    }

    #[test]
    fn native_sync_wins() {
        let tracker = VersionTracker::new();
        let scope = VersionScope::attribute(EntityKind::Edge, "weight");
        tracker.bump(scope.clone());
        tracker.sync(scope.clone(), 40);
        assert_eq!(tracker.read(&scope), 40);
        // Unknown native values are ignored.
        tracker.sync(scope.clone(), VERSION_UNKNOWN);
        assert_eq!(tracker.read(&scope), 40);
    }

    #[test]
    fn topology_bump_invalidates_packed_dependents() {
        let tracker = VersionTracker::new();
        let packed = VersionScope::packed(EntityKind::Node, "position");
        let other = VersionScope::packed(EntityKind::Edge, "weight");
        let before = tracker.bump(packed.clone());
        let edge_before = tracker.bump(other.clone());

        tracker.bump_packed_dependents(EntityKind::Node);
        assert!(tracker.read(&packed) > before);
        assert_eq!(tracker.read(&other), edge_before);
    }

    #[test]
    fn scope_display_names_the_scope() {
        let scope = VersionScope::attribute(EntityKind::Node, "weight");
        assert_eq!(scope.to_string(), "node attribute \"weight\"");
        let scope = VersionScope::Topology(EntityKind::Edge);
        assert_eq!(scope.to_string(), "edge topology");
    }
}
