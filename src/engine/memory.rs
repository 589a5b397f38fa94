//! In-memory reference engine.
//!
//! `MemoryEngine` implements the full [`GraphEngine`] ABI against a plain
//! `Vec<u8>` linear heap: bump allocation, capacity-sized attribute
//! buffers, activity flags with valid-window maintenance, native repack,
//! optional native version counters, and one steppable computation kind
//! (`components`, budgeted connected-components labeling). It serves as the
//! executable specification of the boundary and as the engine the tests
//! drive; a production build links the real module instead.
//!
//! The heap deliberately mimics foreign-memory behavior: growing an entity
//! table reallocates every attribute buffer, so previously observed
//! offsets go stale exactly as they would across a real reallocation.

use std::collections::HashMap;
use tracing::trace;

use crate::engine::{
    AttributeMeta, ComputationHandle, ComputationParams, ComputationSummary, ElementType,
    EntityKind, GraphEngine, ProgressReport, RawBuffer, PHASE_DONE, PHASE_FAILED, PHASE_IDLE,
};
use crate::error::{Result, RuntimeError};
use crate::version::VersionScope;

const ALIGN: usize = 8;

/// Name of the steppable computation `MemoryEngine` implements.
pub const COMPONENTS: &str = "components";

#[derive(Debug, Default)]
struct EntityTable {
    active: Vec<bool>,
    active_count: usize,
    valid_start: usize,
    valid_end: usize,
    custom_order: bool,
}

impl EntityTable {
    fn capacity(&self) -> usize {
        self.active.len()
    }

    /// Allocates `count` fresh indices at the top of the window.
    /// Returns the new ids and whether capacity grew.
    fn add(&mut self, count: usize) -> (Vec<u32>, bool) {
        let start = self.valid_end;
        let end = start + count;
        let grew = end > self.capacity();
        if grew {
            let new_cap = end.max(self.capacity() * 2).max(8);
            self.active.resize(new_cap, false);
        }
        for slot in &mut self.active[start..end] {
            *slot = true;
        }
        self.active_count += count;
        self.valid_end = end;
        if self.active_count == count {
            self.valid_start = start;
        }
        ((start as u32..end as u32).collect(), grew)
    }

    fn remove(&mut self, ids: &[u32]) -> Result<()> {
        // Deactivate as we validate so a duplicate id in the same call
        // reads as already inactive; roll back on any rejection.
        for (pos, &id) in ids.iter().enumerate() {
            let idx = id as usize;
            if idx >= self.capacity() || !self.active[idx] {
                for &done in &ids[..pos] {
                    self.active[done as usize] = true;
                }
                return Err(RuntimeError::InvalidArgument(format!(
                    "entity {id} is not active"
                )));
            }
            self.active[idx] = false;
        }
        self.active_count -= ids.len();
        self.shrink_window();
        Ok(())
    }

    fn shrink_window(&mut self) {
        while self.valid_start < self.valid_end && !self.active[self.valid_start] {
            self.valid_start += 1;
        }
        while self.valid_end > self.valid_start && !self.active[self.valid_end - 1] {
            self.valid_end -= 1;
        }
        if self.active_count == 0 {
            self.valid_start = 0;
            self.valid_end = 0;
        }
    }

    fn is_active(&self, id: u32) -> bool {
        (id as usize) < self.capacity() && self.active[id as usize]
    }

    fn active_ids(&self) -> impl Iterator<Item = u32> + '_ {
        (self.valid_start..self.valid_end)
            .filter(|&i| self.active[i])
            .map(|i| i as u32)
    }
}

#[derive(Debug)]
struct AttrStore {
    element: ElementType,
    dimension: usize,
    offset: usize,
}

impl AttrStore {
    fn stride(&self) -> usize {
        self.dimension * self.element.size_bytes()
    }
}

#[derive(Debug)]
struct ComponentsRun {
    node_ids: Vec<u32>,
    labels: HashMap<u32, u32>,
    edges: Vec<(u32, u32)>,
    cursor: usize,
    pass: u32,
    max_passes: u32,
    changed_this_pass: bool,
    work_done: u64,
    phase: u32,
}

impl ComponentsRun {
    fn step(&mut self, budget: u32) -> u32 {
        if self.phase == PHASE_DONE || self.phase == PHASE_FAILED {
            return self.phase;
        }
        if self.edges.is_empty() {
            self.phase = PHASE_DONE;
            return self.phase;
        }
        self.phase = 1;
        for _ in 0..budget {
            let (a, b) = self.edges[self.cursor];
            let la = self.labels[&a];
            let lb = self.labels[&b];
            if la != lb {
                let low = la.min(lb);
                self.labels.insert(a, low);
                self.labels.insert(b, low);
                self.changed_this_pass = true;
            }
            self.work_done += 1;
            self.cursor += 1;
            if self.cursor == self.edges.len() {
                self.cursor = 0;
                self.pass += 1;
                if !self.changed_this_pass || self.pass >= self.max_passes {
                    self.phase = PHASE_DONE;
                    break;
                }
                self.changed_this_pass = false;
            }
        }
        self.phase
    }

    fn progress(&self) -> ProgressReport {
        let total = (self.edges.len() as f64 * self.max_passes as f64).max(1.0);
        ProgressReport {
            current: self.work_done as f64,
            total,
            phase: self.phase,
        }
    }

    fn group_count(&self) -> u32 {
        let mut seen: Vec<u32> = self.node_ids.iter().map(|id| self.labels[id]).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len() as u32
    }
}

/// Reference implementation of the foreign engine, backed by an owned
/// linear heap.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    heap: Vec<u8>,
    nodes: EntityTable,
    edges: EntityTable,
    edge_pairs: Vec<(u32, u32)>,
    node_attrs: HashMap<String, AttrStore>,
    edge_attrs: HashMap<String, AttrStore>,
    native_counters: Option<HashMap<VersionScope, u64>>,
    computations: HashMap<u64, ComponentsRun>,
    next_handle: u64,
    fail_next_step: bool,
    repack_calls: u64,
    directed: bool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        let mut engine = Self {
            next_handle: 1,
            ..Self::default()
        };
        // Reserve the low bytes so a real allocation never sits at the
        // empty sentinel offset 0.
        engine.heap.resize(ALIGN, 0);
        engine
    }

    pub fn directed() -> Self {
        let mut engine = Self::new();
        engine.directed = true;
        engine
    }

    /// Enables engine-side version counters, which the tracker treats as
    /// authoritative.
    pub fn with_native_versions(mut self) -> Self {
        self.native_counters = Some(HashMap::new());
        self
    }

    /// Forces the repack path for `kind` by marking a custom iteration
    /// order active.
    pub fn set_custom_order(&mut self, kind: EntityKind, custom: bool) {
        self.table_mut(kind).custom_order = custom;
    }

    /// Number of repack entry-point invocations since creation.
    pub fn repack_calls(&self) -> u64 {
        self.repack_calls
    }

    /// Makes the next computation step report the failed phase, modeling
    /// a native error.
    pub fn inject_step_failure(&mut self) {
        self.fail_next_step = true;
    }

    fn table(&self, kind: EntityKind) -> &EntityTable {
        match kind {
            EntityKind::Node => &self.nodes,
            EntityKind::Edge => &self.edges,
        }
    }

    fn table_mut(&mut self, kind: EntityKind) -> &mut EntityTable {
        match kind {
            EntityKind::Node => &mut self.nodes,
            EntityKind::Edge => &mut self.edges,
        }
    }

    fn attrs(&self, kind: EntityKind) -> &HashMap<String, AttrStore> {
        match kind {
            EntityKind::Node => &self.node_attrs,
            EntityKind::Edge => &self.edge_attrs,
        }
    }

    fn alloc(&mut self, bytes: usize) -> usize {
        let pad = (ALIGN - self.heap.len() % ALIGN) % ALIGN;
        let offset = self.heap.len() + pad;
        self.heap.resize(offset + bytes, 0);
        offset
    }

    /// Moves every attribute buffer of `kind` into storage sized for the
    /// new capacity. Old offsets go stale, as across any reallocation.
    fn regrow_attributes(&mut self, kind: EntityKind, old_capacity: usize) {
        let new_capacity = self.table(kind).capacity();
        let names: Vec<String> = self.attrs(kind).keys().cloned().collect();
        for name in names {
            let (old_offset, stride) = {
                let store = &self.attrs(kind)[&name];
                (store.offset, store.stride())
            };
            let old_bytes =
                self.heap[old_offset..old_offset + old_capacity * stride].to_vec();
            let new_offset = self.alloc(new_capacity * stride);
            self.heap[new_offset..new_offset + old_bytes.len()].copy_from_slice(&old_bytes);
            let store = match kind {
                EntityKind::Node => self.node_attrs.get_mut(&name),
                EntityKind::Edge => self.edge_attrs.get_mut(&name),
            };
            if let Some(store) = store {
                store.offset = new_offset;
            }
        }
    }

    fn bump_native(&mut self, scope: VersionScope) {
        if let Some(counters) = self.native_counters.as_mut() {
            let entry = counters.entry(scope).or_insert(1);
            *entry = if *entry == u64::MAX { 1 } else { *entry + 1 };
        }
    }

    fn run(&self, handle: ComputationHandle) -> Result<&ComponentsRun> {
        self.computations
            .get(&handle.0)
            .ok_or_else(|| RuntimeError::NotFound(format!("computation handle {}", handle.0)))
    }

    fn run_mut(&mut self, handle: ComputationHandle) -> Result<&mut ComponentsRun> {
        self.computations
            .get_mut(&handle.0)
            .ok_or_else(|| RuntimeError::NotFound(format!("computation handle {}", handle.0)))
    }
}

impl GraphEngine for MemoryEngine {
    fn entity_count(&self, kind: EntityKind) -> usize {
        self.table(kind).active_count
    }

    fn entity_capacity(&self, kind: EntityKind) -> usize {
        self.table(kind).capacity()
    }

    fn is_directed(&self) -> bool {
        self.directed
    }

    fn topology_raw(&self, kind: EntityKind) -> RawBuffer {
        let table = self.table(kind);
        RawBuffer {
            offset: 0,
            count: table.active_count,
            capacity_bytes: table.capacity() * std::mem::size_of::<u32>(),
            stride: std::mem::size_of::<u32>(),
            valid_start: table.valid_start,
            valid_end: table.valid_end,
            dirty: false,
        }
    }

    fn has_custom_order(&self, kind: EntityKind) -> bool {
        self.table(kind).custom_order
    }

    fn add_nodes(&mut self, count: usize) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let old_capacity = self.nodes.capacity();
        let (ids, grew) = self.nodes.add(count);
        if grew {
            self.regrow_attributes(EntityKind::Node, old_capacity);
        }
        self.bump_native(VersionScope::Topology(EntityKind::Node));
        trace!(count, "added nodes");
        Ok(ids)
    }

    fn remove_nodes(&mut self, ids: &[u32]) -> Result<Vec<u32>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.nodes.remove(ids)?;
        // Cascade to incident edges.
        let doomed: Vec<u32> = self
            .edges
            .active_ids()
            .filter(|&e| {
                let (from, to) = self.edge_pairs[e as usize];
                ids.contains(&from) || ids.contains(&to)
            })
            .collect();
        if !doomed.is_empty() {
            self.edges.remove(&doomed)?;
            self.bump_native(VersionScope::Topology(EntityKind::Edge));
        }
        self.bump_native(VersionScope::Topology(EntityKind::Node));
        trace!(removed = ids.len(), cascaded = doomed.len(), "removed nodes");
        Ok(doomed)
    }

    fn add_edges(&mut self, pairs: &[(u32, u32)]) -> Result<Vec<u32>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        for &(from, to) in pairs {
            if !self.nodes.is_active(from) || !self.nodes.is_active(to) {
                return Err(RuntimeError::InvalidArgument(format!(
                    "edge ({from}, {to}) references an inactive node"
                )));
            }
        }
        let old_capacity = self.edges.capacity();
        let (ids, grew) = self.edges.add(pairs.len());
        if grew {
            self.regrow_attributes(EntityKind::Edge, old_capacity);
        }
        if self.edge_pairs.len() < self.edges.capacity() {
            self.edge_pairs.resize(self.edges.capacity(), (0, 0));
        }
        for (&id, &pair) in ids.iter().zip(pairs) {
            self.edge_pairs[id as usize] = pair;
        }
        self.bump_native(VersionScope::Topology(EntityKind::Edge));
        trace!(count = pairs.len(), "added edges");
        Ok(ids)
    }

    fn remove_edges(&mut self, ids: &[u32]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.edges.remove(ids)?;
        self.bump_native(VersionScope::Topology(EntityKind::Edge));
        Ok(())
    }

    fn edge_endpoints(&self, id: u32) -> Option<(u32, u32)> {
        self.edges
            .is_active(id)
            .then(|| self.edge_pairs[id as usize])
    }

    fn define_attribute(
        &mut self,
        kind: EntityKind,
        name: &str,
        element: ElementType,
        dimension: usize,
    ) -> Result<()> {
        if dimension == 0 {
            return Err(RuntimeError::InvalidArgument(
                "attribute dimension must be at least 1".into(),
            ));
        }
        if self.attrs(kind).contains_key(name) {
            return Err(RuntimeError::InvalidArgument(format!(
                "attribute \"{name}\" already defined on {}",
                kind.label()
            )));
        }
        let capacity = self.table(kind).capacity();
        let stride = dimension * element.size_bytes();
        let offset = self.alloc(capacity.max(1) * stride);
        let store = AttrStore {
            element,
            dimension,
            offset,
        };
        match kind {
            EntityKind::Node => self.node_attrs.insert(name.to_string(), store),
            EntityKind::Edge => self.edge_attrs.insert(name.to_string(), store),
        };
        trace!(kind = kind.label(), name, "defined attribute");
        Ok(())
    }

    fn has_attribute(&self, kind: EntityKind, name: &str) -> bool {
        self.attrs(kind).contains_key(name)
    }

    fn attribute_meta(&self, kind: EntityKind, name: &str) -> Option<AttributeMeta> {
        self.attrs(kind).get(name).map(|store| AttributeMeta {
            element: store.element,
            dimension: store.dimension,
        })
    }

    fn attribute_raw(&self, kind: EntityKind, name: &str) -> Result<RawBuffer> {
        let store = self.attrs(kind).get(name).ok_or_else(|| {
            RuntimeError::NotFound(format!("{} attribute \"{name}\"", kind.label()))
        })?;
        let table = self.table(kind);
        Ok(RawBuffer {
            offset: store.offset,
            count: table.active_count,
            capacity_bytes: table.capacity() * store.stride(),
            stride: store.stride(),
            valid_start: table.valid_start,
            valid_end: table.valid_end,
            dirty: false,
        })
    }

    fn repack_attribute(&mut self, kind: EntityKind, name: &str) -> Result<RawBuffer> {
        let raw = self.attribute_raw(kind, name)?;
        let ids: Vec<u32> = self.table(kind).active_ids().collect();
        let packed_offset = self.alloc(ids.len().max(1) * raw.stride);
        for (slot, &id) in ids.iter().enumerate() {
            let src = raw.offset + id as usize * raw.stride;
            let dst = packed_offset + slot * raw.stride;
            self.heap.copy_within(src..src + raw.stride, dst);
        }
        self.repack_calls += 1;
        trace!(kind = kind.label(), name, count = ids.len(), "repacked attribute");
        Ok(RawBuffer {
            offset: packed_offset,
            count: ids.len(),
            capacity_bytes: ids.len() * raw.stride,
            stride: raw.stride,
            valid_start: 0,
            valid_end: ids.len(),
            dirty: false,
        })
    }

    fn repack_indices(&mut self, kind: EntityKind) -> Result<RawBuffer> {
        let ids: Vec<u32> = self.table(kind).active_ids().collect();
        let stride = std::mem::size_of::<u32>();
        let offset = self.alloc(ids.len().max(1) * stride);
        for (slot, &id) in ids.iter().enumerate() {
            let at = offset + slot * stride;
            self.heap[at..at + stride].copy_from_slice(&id.to_le_bytes());
        }
        self.repack_calls += 1;
        Ok(RawBuffer {
            offset,
            count: ids.len(),
            capacity_bytes: ids.len() * stride,
            stride,
            valid_start: 0,
            valid_end: ids.len(),
            dirty: false,
        })
    }

    fn memory(&self) -> &[u8] {
        &self.heap
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.heap
    }

    // A scope the engine never bumped has no native counter yet; the
    // tracker keeps counting locally until one appears.
    fn native_version(&self, scope: &VersionScope) -> Option<u64> {
        self.native_counters
            .as_ref()
            .and_then(|counters| counters.get(scope).copied())
    }

    fn bump_native_version(&mut self, scope: &VersionScope) -> Option<u64> {
        self.native_counters.as_ref()?;
        self.bump_native(scope.clone());
        self.native_version(scope)
    }

    fn supports_computation(&self, kind: &str) -> bool {
        kind == COMPONENTS
    }

    fn computation_create(
        &mut self,
        kind: &str,
        params: &ComputationParams,
    ) -> Result<ComputationHandle> {
        if kind != COMPONENTS {
            return Err(RuntimeError::MissingEntryPoint(format!(
                "computation kind \"{kind}\""
            )));
        }
        let node_ids: Vec<u32> = self.nodes.active_ids().collect();
        if node_ids.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "cannot run a computation over an empty selection".into(),
            ));
        }
        let labels = node_ids.iter().map(|&id| (id, id)).collect();
        let edges = self
            .edges
            .active_ids()
            .map(|e| self.edge_pairs[e as usize])
            .collect();
        let handle = self.next_handle;
        self.next_handle += 1;
        self.computations.insert(
            handle,
            ComponentsRun {
                node_ids,
                labels,
                edges,
                cursor: 0,
                pass: 0,
                max_passes: params.max_passes.max(1),
                changed_this_pass: false,
                work_done: 0,
                phase: PHASE_IDLE,
            },
        );
        trace!(handle, "created components computation");
        Ok(ComputationHandle(handle))
    }

    fn computation_step(&mut self, handle: ComputationHandle, budget: u32) -> Result<u32> {
        if self.fail_next_step {
            self.fail_next_step = false;
            let run = self.run_mut(handle)?;
            run.phase = PHASE_FAILED;
            return Ok(PHASE_FAILED);
        }
        let run = self.run_mut(handle)?;
        Ok(run.step(budget.max(1)))
    }

    fn computation_progress(&self, handle: ComputationHandle) -> Result<ProgressReport> {
        Ok(self.run(handle)?.progress())
    }

    fn computation_finalize(
        &mut self,
        handle: ComputationHandle,
        out_name: &str,
    ) -> Result<ComputationSummary> {
        let phase = self.run(handle)?.phase;
        if phase != PHASE_DONE {
            return Err(RuntimeError::InvalidArgument(format!(
                "computation is not done (phase {phase})"
            )));
        }
        if !self.has_attribute(EntityKind::Node, out_name) {
            self.define_attribute(EntityKind::Node, out_name, ElementType::U32, 1)?;
        }
        let raw = self.attribute_raw(EntityKind::Node, out_name)?;
        let run = self.run(handle)?;
        let writes: Vec<(usize, u32)> = run
            .node_ids
            .iter()
            .map(|&id| (raw.offset + id as usize * raw.stride, run.labels[&id]))
            .collect();
        let entity_count = run.node_ids.len() as u32;
        let group_count = run.group_count();
        for (at, label) in writes {
            self.heap[at..at + 4].copy_from_slice(&label.to_le_bytes());
        }
        self.bump_native(VersionScope::attribute(EntityKind::Node, out_name));
        Ok(ComputationSummary {
            entity_count,
            group_count,
            score: 1.0 - f64::from(group_count) / f64::from(entity_count.max(1)),
        })
    }

    fn computation_destroy(&mut self, handle: ComputationHandle) {
        self.computations.remove(&handle.0);
    }
}
