//! Dense buffer cache: flat, contiguous views over active entities' data.
//!
//! Attribute storage in the engine is sparse and capacity-sized; consumers
//! (renderers, computations, serializers) want gap-free arrays covering
//! only the active entities. This module produces those views two ways:
//!
//! 1. **Aliasing** — when no custom order is active and the active range is
//!    contiguous (`count == valid_end - valid_start`), the dense view is
//!    pure pointer arithmetic into existing storage: `base +
//!    valid_start * stride`. No foreign call, O(1).
//! 2. **Repacking** — otherwise the native repack entry point gathers
//!    active entities into a separate contiguous buffer (engine-chosen
//!    order) and the cache wraps its descriptor.
//!
//! Descriptors are cached per `(kind, name)` and tagged with the scope's
//! version at refresh time; an unchanged version is a pure cache hit with
//! no re-derivation. Descriptors are replaced on refresh, never mutated in
//! place.
//!
//! Special case: the "list of active ids" over a contiguous range is a
//! virtual identity buffer — the sequence `[valid_start..valid_end)`
//! synthesized locally with no foreign buffer at all.

pub mod guard;
pub mod view;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::engine::{EntityKind, GraphEngine, RawBuffer};
use crate::error::{Result, RuntimeError};
use crate::version::{VersionScope, VersionTracker};

/// How a dense descriptor maps onto storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Arithmetic alias into existing sparse storage.
    Aliased,
    /// Engine-packed copy in a separate contiguous buffer.
    Packed,
    /// Locally synthesized id sequence; no foreign buffer exists.
    VirtualIdentity,
    /// No active entities. Offset 0 is the canonical empty sentinel.
    Empty,
}

/// A dense view over active entities' data.
///
/// Valid only as long as no intervening call could have reallocated or
/// repacked the backing store — enforced by comparing `version` before
/// trusting a cached descriptor, and by the
/// [`AccessGuard`](guard::AccessGuard) while a view derived from it is
/// live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Byte offset of the dense data within linear memory. 0 = empty or
    /// virtual.
    pub offset: usize,
    /// Number of active entities covered.
    pub count: usize,
    /// Allocated bytes behind `offset`.
    pub capacity_bytes: usize,
    /// Bytes from one entity's data to the next.
    pub stride: usize,
    /// Valid window start (entity index space).
    pub valid_start: usize,
    /// Valid window end, exclusive.
    pub valid_end: usize,
    /// Engine-reported staleness of the underlying buffer.
    pub dirty: bool,
    /// Version of the owning scope at refresh time.
    pub version: u64,
    pub mode: BufferMode,
}

impl BufferDescriptor {
    fn empty(version: u64) -> Self {
        Self {
            offset: 0,
            count: 0,
            capacity_bytes: 0,
            stride: 0,
            valid_start: 0,
            valid_end: 0,
            dirty: false,
            version,
            mode: BufferMode::Empty,
        }
    }

    fn aliased(raw: &RawBuffer, version: u64) -> Self {
        Self {
            offset: raw.offset + raw.valid_start * raw.stride,
            count: raw.count,
            capacity_bytes: raw.capacity_bytes,
            stride: raw.stride,
            valid_start: raw.valid_start,
            valid_end: raw.valid_end,
            dirty: raw.dirty,
            version,
            mode: BufferMode::Aliased,
        }
    }

    fn packed(raw: &RawBuffer, version: u64) -> Self {
        Self {
            offset: raw.offset,
            count: raw.count,
            capacity_bytes: raw.capacity_bytes,
            stride: raw.stride,
            valid_start: raw.valid_start,
            valid_end: raw.valid_end,
            dirty: false,
            version,
            mode: BufferMode::Packed,
        }
    }

    fn identity(raw: &RawBuffer, version: u64) -> Self {
        Self {
            offset: 0,
            count: raw.count,
            capacity_bytes: 0,
            stride: std::mem::size_of::<u32>(),
            valid_start: raw.valid_start,
            valid_end: raw.valid_end,
            dirty: false,
            version,
            mode: BufferMode::VirtualIdentity,
        }
    }
}

/// Outcome of a read-only cache resolution.
///
/// `NeedsRepack` means the caller must take the allocation path (guard
/// check, write lock, native repack).
pub(crate) enum Resolve {
    Ready(BufferDescriptor),
    NeedsRepack,
}

/// Version-tagged cache of dense buffer descriptors.
///
/// Thread-safe; invalidation is exact (version comparison), never
/// time- or capacity-based.
#[derive(Debug, Default)]
pub struct DenseBufferCache {
    attributes: DashMap<(EntityKind, String), BufferDescriptor>,
    indices: DashMap<EntityKind, BufferDescriptor>,
    hits: AtomicU64,
    refreshes: AtomicU64,
}

impl DenseBufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` iff the dense view can alias existing storage: no custom
    /// order and a gap-free active window.
    pub fn can_alias(raw: &RawBuffer, custom_order: bool) -> bool {
        !custom_order && raw.count == raw.valid_end - raw.valid_start
    }

    /// Read-only resolution for a named attribute: cache hit, arithmetic
    /// alias, or empty — or a request to repack.
    pub(crate) fn resolve_attribute<E: GraphEngine>(
        &self,
        engine: &E,
        tracker: &VersionTracker,
        kind: EntityKind,
        name: &str,
    ) -> Result<Resolve> {
        if !engine.has_attribute(kind, name) {
            return Err(RuntimeError::NotFound(format!(
                "{} attribute \"{name}\"",
                kind.label()
            )));
        }
        let scope = VersionScope::packed(kind, name);
        let version = tracker.read(&scope);

        if let Some(cached) = self.attributes.get(&(kind, name.to_string())) {
            if cached.version == version {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(kind = kind.label(), name, version, "dense cache hit");
                return Ok(Resolve::Ready(*cached));
            }
        }

        let raw = engine.attribute_raw(kind, name)?;
        if raw.count == 0 {
            let desc = BufferDescriptor::empty(version);
            self.store_attribute(kind, name, desc);
            return Ok(Resolve::Ready(desc));
        }
        if Self::can_alias(&raw, engine.has_custom_order(kind)) {
            let desc = BufferDescriptor::aliased(&raw, version);
            self.store_attribute(kind, name, desc);
            debug!(
                kind = kind.label(),
                name,
                offset = desc.offset,
                count = desc.count,
                "dense view aliased"
            );
            return Ok(Resolve::Ready(desc));
        }
        Ok(Resolve::NeedsRepack)
    }

    /// Refreshes a named attribute through the native repack entry point.
    /// The caller has already passed the guard check.
    pub(crate) fn refresh_attribute<E: GraphEngine>(
        &self,
        engine: &mut E,
        tracker: &VersionTracker,
        kind: EntityKind,
        name: &str,
    ) -> Result<BufferDescriptor> {
        let scope = VersionScope::packed(kind, name);
        let version = tracker.read(&scope);
        let raw = engine.repack_attribute(kind, name)?;
        let desc = BufferDescriptor::packed(&raw, version);
        self.store_attribute(kind, name, desc);
        debug!(
            kind = kind.label(),
            name,
            offset = desc.offset,
            count = desc.count,
            "dense view repacked"
        );
        Ok(desc)
    }

    /// Read-only resolution for the active id list of `kind`.
    pub(crate) fn resolve_indices<E: GraphEngine>(
        &self,
        engine: &E,
        tracker: &VersionTracker,
        kind: EntityKind,
        allow_identity: bool,
    ) -> Result<Resolve> {
        let scope = VersionScope::Topology(kind);
        let version = tracker.read(&scope);

        if let Some(cached) = self.indices.get(&kind) {
            if cached.version == version {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(kind = kind.label(), version, "dense index cache hit");
                return Ok(Resolve::Ready(*cached));
            }
        }

        let raw = engine.topology_raw(kind);
        if raw.count == 0 {
            let desc = BufferDescriptor::empty(version);
            self.store_indices(kind, desc);
            return Ok(Resolve::Ready(desc));
        }
        if allow_identity && Self::can_alias(&raw, engine.has_custom_order(kind)) {
            let desc = BufferDescriptor::identity(&raw, version);
            self.store_indices(kind, desc);
            debug!(
                kind = kind.label(),
                start = raw.valid_start,
                end = raw.valid_end,
                "identity index synthesized"
            );
            return Ok(Resolve::Ready(desc));
        }
        Ok(Resolve::NeedsRepack)
    }

    /// Refreshes the active id list through the native repack entry point.
    pub(crate) fn refresh_indices<E: GraphEngine>(
        &self,
        engine: &mut E,
        tracker: &VersionTracker,
        kind: EntityKind,
    ) -> Result<BufferDescriptor> {
        let scope = VersionScope::Topology(kind);
        let version = tracker.read(&scope);
        let raw = engine.repack_indices(kind)?;
        let desc = BufferDescriptor::packed(&raw, version);
        self.store_indices(kind, desc);
        debug!(kind = kind.label(), count = desc.count, "index repacked");
        Ok(desc)
    }

    /// Discards the cached descriptor for a removed attribute.
    pub fn forget_attribute(&self, kind: EntityKind, name: &str) {
        self.attributes.remove(&(kind, name.to_string()));
    }

    /// Discards everything; used on graph disposal.
    pub fn clear(&self) {
        self.attributes.clear();
        self.indices.clear();
    }

    /// (cache hits, refreshes) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.refreshes.load(Ordering::Relaxed),
        )
    }

    fn store_attribute(&self, kind: EntityKind, name: &str, desc: BufferDescriptor) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.attributes.insert((kind, name.to_string()), desc);
    }

    fn store_indices(&self, kind: EntityKind, desc: BufferDescriptor) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.indices.insert(kind, desc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_requires_gap_free_window() {
        let contiguous = RawBuffer {
            offset: 1024,
            count: 10,
            capacity_bytes: 4096,
            stride: 8,
            valid_start: 2,
            valid_end: 12,
            dirty: false,
        };
        assert!(DenseBufferCache::can_alias(&contiguous, false));
        assert!(!DenseBufferCache::can_alias(&contiguous, true));

        let holey = RawBuffer {
            count: 9,
            ..contiguous
        };
        assert!(!DenseBufferCache::can_alias(&holey, false));
    }

    #[test]
    fn aliased_descriptor_is_pure_arithmetic() {
        let raw = RawBuffer {
            offset: 1024,
            count: 10,
            capacity_bytes: 4096,
            stride: 8,
            valid_start: 3,
            valid_end: 13,
            dirty: false,
        };
        let desc = BufferDescriptor::aliased(&raw, 7);
        assert_eq!(desc.offset, 1024 + 3 * 8);
        assert_eq!(desc.count, 10);
        assert_eq!(desc.version, 7);
        assert_eq!(desc.mode, BufferMode::Aliased);
    }

    #[test]
    fn empty_descriptor_uses_offset_zero_sentinel() {
        let desc = BufferDescriptor::empty(1);
        assert_eq!(desc.offset, 0);
        assert_eq!(desc.mode, BufferMode::Empty);
    }

    #[test]
    fn index_resolution_counts_as_a_refresh() {
        use crate::engine::memory::MemoryEngine;

        let mut engine = MemoryEngine::new();
        engine.add_nodes(4).unwrap();
        let tracker = VersionTracker::new();
        let cache = DenseBufferCache::new();

        let resolved = cache
            .resolve_indices(&engine, &tracker, EntityKind::Node, true)
            .unwrap();
        assert!(matches!(resolved, Resolve::Ready(_)));
        assert_eq!(cache.stats(), (0, 1));

        // Unchanged version: pure hit, no second refresh.
        cache
            .resolve_indices(&engine, &tracker, EntityKind::Node, true)
            .unwrap();
        assert_eq!(cache.stats(), (1, 1));
    }
}
