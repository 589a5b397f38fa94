//! The graph runtime: one handle tying the engine, version tracker, dense
//! cache, and buffer access guard together.
//!
//! [`GraphRuntime`] is the only way the rest of the crate (and the host)
//! touches the engine. Every mutation funnels through the same sequence:
//! liveness check, guard check, write lock, engine call, version bump.
//! Every dense read resolves through the cache first and only falls back
//! to the native repack path when the cached descriptor is stale and the
//! buffer cannot alias existing storage.
//!
//! The handle is cheap to clone (`Arc` inside) and shared with sessions
//! and the worker apply path.

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::dense::guard::AccessGuard;
use crate::dense::view::{DenseView, DenseViewMut, Element, IndexView};
use crate::dense::{BufferDescriptor, BufferMode, DenseBufferCache, Resolve};
use crate::engine::{AttributeMeta, ComputationParams, ElementType, EntityKind, GraphEngine};
use crate::error::{Result, RuntimeError};
use crate::session::{Session, SessionConfig};
use crate::version::{VersionScope, VersionTracker};
use crate::worker::{WorkerResult, WorkerSnapshot};

struct RuntimeInner<E> {
    engine: RwLock<E>,
    tracker: VersionTracker,
    cache: DenseBufferCache,
    guard: AccessGuard,
    disposed: AtomicBool,
    config: RuntimeConfig,
}

/// Shared handle to one graph and its runtime state.
pub struct GraphRuntime<E: GraphEngine> {
    inner: Arc<RuntimeInner<E>>,
}

impl<E: GraphEngine> Clone for GraphRuntime<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: GraphEngine> GraphRuntime<E> {
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, RuntimeConfig::default())
    }

    pub fn with_config(engine: E, config: RuntimeConfig) -> Self {
        info!(
            step_budget = config.step_budget,
            chunk_budget = config.chunk_budget,
            "graph runtime created"
        );
        Self {
            inner: Arc::new(RuntimeInner {
                engine: RwLock::new(engine),
                tracker: VersionTracker::new(),
                cache: DenseBufferCache::new(),
                guard: AccessGuard::new(),
                disposed: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// (dense cache hits, dense cache refreshes) since creation.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.inner.cache.stats()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(RuntimeError::Disposed("graph runtime"));
        }
        Ok(())
    }

    /// Read access to the engine; used by tests and diagnostics.
    pub fn with_engine<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        f(&self.inner.engine.read())
    }

    /// Mutable engine access without version bookkeeping.
    ///
    /// Escape hatch for callers that drive engine internals directly
    /// (test hooks, host-side debugging). Anything that changes data the
    /// dense layer can see must be followed by [`bump_version`].
    ///
    /// [`bump_version`]: GraphRuntime::bump_version
    pub fn with_engine_mut<R>(&self, f: impl FnOnce(&mut E) -> R) -> Result<R> {
        self.ensure_live()?;
        self.inner.guard.assert_can_allocate("access engine mutably")?;
        Ok(f(&mut self.inner.engine.write()))
    }

    pub(crate) fn lock_engine(&self) -> Result<RwLockReadGuard<'_, E>> {
        self.ensure_live()?;
        Ok(self.inner.engine.read())
    }

    pub(crate) fn lock_engine_mut(
        &self,
        operation: &'static str,
    ) -> Result<RwLockWriteGuard<'_, E>> {
        self.ensure_live()?;
        self.inner.guard.assert_can_allocate(operation)?;
        Ok(self.inner.engine.write())
    }

    // ------------------------------------------------------------------
    // Versions

    /// Current version of `scope`, folding the engine's native counter in
    /// first when one exists.
    pub fn version(&self, scope: &VersionScope) -> u64 {
        if let Some(native) = self.inner.engine.read().native_version(scope) {
            self.inner.tracker.sync(scope.clone(), native);
        }
        self.inner.tracker.read(scope)
    }

    /// Manually advances the version of `scope`.
    ///
    /// For hosts that write attribute bytes through raw memory access
    /// instead of [`with_attribute_mut`](GraphRuntime::with_attribute_mut);
    /// the tracker cannot observe such writes on its own.
    pub fn bump_version(&self, scope: VersionScope) -> Result<()> {
        let mut engine = self.lock_engine_mut("bump version")?;
        self.bump_scope(&mut engine, scope);
        Ok(())
    }

    /// One bump, with the dependent-scope fan-out.
    ///
    /// Native counters are authoritative: when the engine keeps its own,
    /// bump there and fold the result back. A topology bump invalidates
    /// every packed buffer of the kind; an attribute bump invalidates its
    /// own packed buffer.
    pub(crate) fn bump_scope(&self, engine: &mut E, scope: VersionScope) {
        match engine.bump_native_version(&scope) {
            Some(native) => self.inner.tracker.sync(scope.clone(), native),
            None => {
                self.inner.tracker.bump(scope.clone());
            }
        }
        match &scope {
            VersionScope::Topology(kind) => self.inner.tracker.bump_packed_dependents(*kind),
            VersionScope::Attribute(kind, name) => {
                self.inner.tracker.bump(VersionScope::packed(*kind, name.clone()));
            }
            VersionScope::Packed(..) => {}
        }
    }

    // ------------------------------------------------------------------
    // Topology

    pub fn entity_count(&self, kind: EntityKind) -> usize {
        self.inner.engine.read().entity_count(kind)
    }

    pub fn node_count(&self) -> usize {
        self.entity_count(EntityKind::Node)
    }

    pub fn edge_count(&self) -> usize {
        self.entity_count(EntityKind::Edge)
    }

    pub fn add_nodes(&self, count: usize) -> Result<Vec<u32>> {
        let mut engine = self.lock_engine_mut("add nodes")?;
        let ids = engine.add_nodes(count)?;
        self.bump_scope(&mut engine, VersionScope::Topology(EntityKind::Node));
        Ok(ids)
    }

    /// Removes nodes along with their incident edges; returns the ids of
    /// the edges removed as a side effect.
    pub fn remove_nodes(&self, ids: &[u32]) -> Result<Vec<u32>> {
        let mut engine = self.lock_engine_mut("remove nodes")?;
        let doomed = engine.remove_nodes(ids)?;
        self.bump_scope(&mut engine, VersionScope::Topology(EntityKind::Node));
        if !doomed.is_empty() {
            self.bump_scope(&mut engine, VersionScope::Topology(EntityKind::Edge));
        }
        Ok(doomed)
    }

    pub fn add_edges(&self, pairs: &[(u32, u32)]) -> Result<Vec<u32>> {
        let mut engine = self.lock_engine_mut("add edges")?;
        let ids = engine.add_edges(pairs)?;
        self.bump_scope(&mut engine, VersionScope::Topology(EntityKind::Edge));
        Ok(ids)
    }

    pub fn remove_edges(&self, ids: &[u32]) -> Result<()> {
        let mut engine = self.lock_engine_mut("remove edges")?;
        engine.remove_edges(ids)?;
        self.bump_scope(&mut engine, VersionScope::Topology(EntityKind::Edge));
        Ok(())
    }

    pub fn edge_endpoints(&self, id: u32) -> Option<(u32, u32)> {
        self.inner.engine.read().edge_endpoints(id)
    }

    // ------------------------------------------------------------------
    // Attributes

    pub fn define_attribute(
        &self,
        kind: EntityKind,
        name: &str,
        element: ElementType,
        dimension: usize,
    ) -> Result<()> {
        let mut engine = self.lock_engine_mut("define attribute")?;
        engine.define_attribute(kind, name, element, dimension)
    }

    pub fn has_attribute(&self, kind: EntityKind, name: &str) -> bool {
        self.inner.engine.read().has_attribute(kind, name)
    }

    pub fn attribute_meta(&self, kind: EntityKind, name: &str) -> Option<AttributeMeta> {
        self.inner.engine.read().attribute_meta(kind, name)
    }

    /// Mutable typed access to an attribute's capacity-sized storage.
    ///
    /// The closure writes by entity id; once it returns, the attribute's
    /// version advances so every dependent dense view refreshes on next
    /// resolution.
    pub fn with_attribute_mut<T: Element, R>(
        &self,
        kind: EntityKind,
        name: &str,
        f: impl FnOnce(&mut DenseViewMut<'_, T>) -> R,
    ) -> Result<R> {
        let mut engine = self.lock_engine_mut("write attribute values")?;
        let meta = engine.attribute_meta(kind, name).ok_or_else(|| {
            RuntimeError::NotFound(format!("{} attribute \"{name}\"", kind.label()))
        })?;
        check_element::<T>(kind, name, meta)?;
        let raw = engine.attribute_raw(kind, name)?;
        let capacity = engine.entity_capacity(kind);
        let stride = raw.stride;
        let bytes = &mut engine.memory_mut()[raw.offset..raw.offset + capacity * stride];
        let mut view = DenseViewMut::new(bytes, capacity, stride, meta.dimension);
        let out = f(&mut view);
        self.bump_scope(&mut engine, VersionScope::attribute(kind, name));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Dense views

    /// Resolved dense descriptor for an attribute, refreshing through the
    /// native repack path when required.
    pub fn dense_descriptor(&self, kind: EntityKind, name: &str) -> Result<BufferDescriptor> {
        let (_lock, desc) = self.resolve_attribute(kind, name)?;
        Ok(desc)
    }

    fn resolve_attribute(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<(RwLockReadGuard<'_, E>, BufferDescriptor)> {
        self.ensure_live()?;
        let read = self.inner.engine.read();
        match self
            .inner
            .cache
            .resolve_attribute(&*read, &self.inner.tracker, kind, name)?
        {
            Resolve::Ready(desc) => Ok((read, desc)),
            Resolve::NeedsRepack => {
                drop(read);
                self.inner.guard.assert_can_allocate("repack dense buffer")?;
                let mut write = self.inner.engine.write();
                let desc = self.inner.cache.refresh_attribute(
                    &mut *write,
                    &self.inner.tracker,
                    kind,
                    name,
                )?;
                Ok((RwLockWriteGuard::downgrade(write), desc))
            }
        }
    }

    fn resolve_indices(
        &self,
        kind: EntityKind,
    ) -> Result<(RwLockReadGuard<'_, E>, BufferDescriptor)> {
        self.ensure_live()?;
        let allow_identity = self.inner.config.identity_buffers;
        let read = self.inner.engine.read();
        match self
            .inner
            .cache
            .resolve_indices(&*read, &self.inner.tracker, kind, allow_identity)?
        {
            Resolve::Ready(desc) => Ok((read, desc)),
            Resolve::NeedsRepack => {
                drop(read);
                self.inner.guard.assert_can_allocate("repack index buffer")?;
                let mut write = self.inner.engine.write();
                let desc =
                    self.inner
                        .cache
                        .refresh_indices(&mut *write, &self.inner.tracker, kind)?;
                Ok((RwLockWriteGuard::downgrade(write), desc))
            }
        }
    }

    /// Dense read view over the active entities' values of an attribute.
    ///
    /// The view holds the engine read lock and a guard token; while it is
    /// alive, every allocation-capable call fails with
    /// [`RuntimeError::BufferAccessActive`].
    pub fn dense_values<T: Element>(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<DenseView<'_, T>> {
        let (lock, desc) = self.resolve_attribute(kind, name)?;
        let meta = lock.attribute_meta(kind, name).ok_or_else(|| {
            RuntimeError::NotFound(format!("{} attribute \"{name}\"", kind.label()))
        })?;
        check_element::<T>(kind, name, meta)?;
        let bytes = map_descriptor(lock, &desc);
        let token = self.inner.guard.enter();
        Ok(DenseView::new(bytes, &desc, meta.dimension, token))
    }

    /// Dense view over the active entity ids of `kind`.
    ///
    /// Contiguous ranges come back as a locally synthesized identity
    /// sequence with no foreign buffer behind it.
    pub fn dense_indices(&self, kind: EntityKind) -> Result<IndexView<'_>> {
        let (lock, desc) = self.resolve_indices(kind)?;
        match desc.mode {
            BufferMode::VirtualIdentity => Ok(IndexView::Identity {
                start: desc.valid_start as u32,
                end: desc.valid_end as u32,
            }),
            BufferMode::Empty => Ok(IndexView::Identity { start: 0, end: 0 }),
            _ => {
                let bytes = map_descriptor(lock, &desc);
                let token = self.inner.guard.enter();
                Ok(IndexView::Packed(DenseView::new(bytes, &desc, 1, token)))
            }
        }
    }

    /// Ids of the active entities of `kind`, in dense order.
    pub fn active_ids(&self, kind: EntityKind) -> Result<Vec<u32>> {
        Ok(self.dense_indices(kind)?.to_vec())
    }

    // ------------------------------------------------------------------
    // Sessions and delegation

    /// Creates a steppable session against this graph.
    pub fn create_session(&self, config: SessionConfig) -> Result<Session<E>> {
        self.ensure_live()?;
        Session::new(self.clone(), config)
    }

    /// Captures an immutable snapshot of the live graph for delegation.
    ///
    /// Node ids are remapped to dense positions `0..n`; edge endpoints
    /// and weights follow. The snapshot shares nothing with the live
    /// graph, so a worker can run against it without holding any lock
    /// here.
    pub fn snapshot(
        &self,
        kind: &str,
        params: &ComputationParams,
        out_attribute: &str,
    ) -> Result<WorkerSnapshot> {
        let node_ids = self.active_ids(EntityKind::Node)?;
        let edge_ids = self.active_ids(EntityKind::Edge)?;

        let engine = self.lock_engine()?;
        if !engine.supports_computation(kind) {
            return Err(RuntimeError::MissingEntryPoint(format!(
                "computation \"{kind}\""
            )));
        }
        let position: HashMap<u32, u32> = node_ids
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, pos as u32))
            .collect();
        let mut edges = Vec::with_capacity(edge_ids.len());
        for &edge in &edge_ids {
            let (from, to) = engine.edge_endpoints(edge).ok_or_else(|| {
                RuntimeError::NotFound(format!("edge {edge}"))
            })?;
            edges.push((position[&from], position[&to]));
        }

        let weights = match &params.weight_attribute {
            Some(attr) => {
                let meta = engine.attribute_meta(EntityKind::Edge, attr).ok_or_else(|| {
                    RuntimeError::NotFound(format!("edge attribute \"{attr}\""))
                })?;
                if meta.element != ElementType::F64 {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "weight attribute \"{attr}\" must be F64, is {:?}",
                        meta.element
                    )));
                }
                let raw = engine.attribute_raw(EntityKind::Edge, attr)?;
                let memory = engine.memory();
                let mut values = Vec::with_capacity(edge_ids.len());
                for &edge in &edge_ids {
                    let at = raw.offset + edge as usize * raw.stride;
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&memory[at..at + 8]);
                    values.push(f64::from_le_bytes(buf));
                }
                Some(values)
            }
            None => None,
        };

        debug!(
            kind,
            nodes = node_ids.len(),
            edges = edges.len(),
            "captured delegation snapshot"
        );
        Ok(WorkerSnapshot {
            kind: kind.to_string(),
            directed: engine.is_directed(),
            node_count: node_ids.len() as u32,
            edges,
            weights,
            params: params.clone(),
            out_attribute: out_attribute.to_string(),
        })
    }

    /// Applies a delegated result to the live graph.
    ///
    /// Refuses with [`RuntimeError::SnapshotMismatch`] when the result's
    /// entity count no longer agrees with the live node count — the graph
    /// mutated while delegation was in flight and positional values would
    /// land on the wrong entities. Nothing is written in that case.
    pub fn apply_worker_result(&self, result: &WorkerResult, out_attribute: &str) -> Result<()> {
        self.ensure_live()?;
        self.inner.guard.assert_can_allocate("apply delegated result")?;
        let ids = self.active_ids(EntityKind::Node)?;
        if result.entity_count as usize != ids.len() {
            return Err(RuntimeError::SnapshotMismatch {
                result: result.entity_count as usize,
                live: ids.len(),
            });
        }

        let mut engine = self.inner.engine.write();
        match engine.attribute_meta(EntityKind::Node, out_attribute) {
            Some(meta) => {
                if meta.element != ElementType::U32 || meta.dimension != 1 {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "destination attribute \"{out_attribute}\" exists with incompatible \
                         type {:?}x{}",
                        meta.element, meta.dimension
                    )));
                }
            }
            None => {
                engine.define_attribute(EntityKind::Node, out_attribute, ElementType::U32, 1)?;
            }
        }
        let raw = engine.attribute_raw(EntityKind::Node, out_attribute)?;
        let stride = raw.stride;
        let offset = raw.offset;
        let memory = engine.memory_mut();
        for (&id, &value) in ids.iter().zip(&result.values) {
            let at = offset + id as usize * stride;
            memory[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        self.bump_scope(&mut engine, VersionScope::attribute(EntityKind::Node, out_attribute));
        info!(
            out = out_attribute,
            entities = ids.len(),
            groups = result.summary.group_count,
            "applied delegated result"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Releases the runtime. Idempotent; every later call on this or any
    /// clone fails with [`RuntimeError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cache.clear();
        info!("graph runtime disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

/// Maps an engine read guard down to the descriptor's byte range.
fn map_descriptor<'a, E: GraphEngine>(
    lock: RwLockReadGuard<'a, E>,
    desc: &BufferDescriptor,
) -> MappedRwLockReadGuard<'a, [u8]> {
    let (start, end) = match desc.mode {
        BufferMode::Empty | BufferMode::VirtualIdentity => (0, 0),
        _ => (desc.offset, desc.offset + desc.count * desc.stride),
    };
    RwLockReadGuard::map(lock, |engine| &engine.memory()[start..end])
}

fn check_element<T: Element>(kind: EntityKind, name: &str, meta: AttributeMeta) -> Result<()> {
    if meta.element != T::TYPE {
        return Err(RuntimeError::InvalidArgument(format!(
            "{} attribute \"{name}\" stores {:?}, requested {:?}",
            kind.label(),
            meta.element,
            T::TYPE
        )));
    }
    Ok(())
}
