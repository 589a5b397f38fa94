//! The foreign engine boundary.
//!
//! The graph engine proper — storage layout, community detection, packing —
//! lives in a separately compiled module reachable only through exported
//! entry points and raw byte offsets into its linear memory. This module
//! defines that boundary as the [`GraphEngine`] trait: a caller-owned handle
//! injected into every component, with lifecycle tied to an explicit
//! create/dispose pair. Tests substitute the in-memory
//! [`MemoryEngine`](memory::MemoryEngine).
//!
//! # Descriptor reads
//!
//! Raw buffer queries return a [`RawBuffer`]: `{offset, count,
//! capacity_bytes, stride, valid_start, valid_end, dirty}`. Offset 0 is the
//! canonical empty sentinel, not an error. A raw read is only trustworthy
//! until the next call that can reallocate the backing store; the dense
//! cache layer enforces that with version tags and the buffer access guard.
//!
//! # Computation handles
//!
//! Long computations follow a handle ABI: `computation_create` allocates,
//! `computation_step(handle, budget)` advances and returns a phase code,
//! `computation_progress` reads counters, `computation_finalize` writes the
//! result into a destination attribute, `computation_destroy` releases. The
//! phase codes come from the native convention: [`PHASE_DONE`] and
//! [`PHASE_FAILED`] are terminal; anything else means still running.

pub mod memory;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::version::VersionScope;

/// Entity scope: the two kinds of indexed entities a graph engine stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Node,
    Edge,
}

impl EntityKind {
    /// Lowercase label used in error messages and cancel reasons.
    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Edge => "edge",
        }
    }
}

/// Element type of an attribute buffer, aligned with the native constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    U8,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElementType {
    /// Size in bytes of one element.
    pub fn size_bytes(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
        }
    }
}

/// Raw descriptor for a capacity-sized buffer inside the engine's linear
/// memory, as reported by the engine itself.
///
/// `valid_start..valid_end` is the window that may contain active entities;
/// `count` is the number of active entities within it. The window is
/// gap-free exactly when `count == valid_end - valid_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    /// Byte offset of the buffer base within linear memory. 0 = empty.
    pub offset: usize,
    /// Number of active entities covered by this buffer.
    pub count: usize,
    /// Total allocated size of the buffer in bytes.
    pub capacity_bytes: usize,
    /// Bytes from one entity's slot to the next.
    pub stride: usize,
    /// First index that may be active.
    pub valid_start: usize,
    /// One past the last index that may be active.
    pub valid_end: usize,
    /// Set when the engine knows the buffer content is out of date.
    pub dirty: bool,
}

impl RawBuffer {
    /// The canonical empty buffer: offset 0, nothing valid.
    pub fn empty() -> Self {
        Self {
            offset: 0,
            count: 0,
            capacity_bytes: 0,
            stride: 0,
            valid_start: 0,
            valid_end: 0,
            dirty: false,
        }
    }
}

/// Metadata describing a defined attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeMeta {
    pub element: ElementType,
    pub dimension: usize,
}

/// Opaque handle to a native computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputationHandle(pub u64);

/// Phase code reported while a computation has not started stepping.
pub const PHASE_IDLE: u32 = 0;
/// Phase code for a computation that completed successfully.
pub const PHASE_DONE: u32 = 5;
/// Phase code for a computation that failed.
pub const PHASE_FAILED: u32 = 6;

/// Coarse classification of a native phase code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseClass {
    Running,
    Done,
    Failed,
}

/// Maps a native phase code onto the three outcomes the session layer
/// cares about. Done and failed codes map directly; anything else is
/// still running.
pub fn classify_phase(code: u32) -> PhaseClass {
    match code {
        PHASE_DONE => PhaseClass::Done,
        PHASE_FAILED => PhaseClass::Failed,
        _ => PhaseClass::Running,
    }
}

/// Scalar parameters handed to a computation at creation.
///
/// The field set mirrors the native create entry point; computations
/// ignore the knobs they do not use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationParams {
    /// Edge attribute supplying weights, when the computation is weighted.
    pub weight_attribute: Option<String>,
    pub resolution: f64,
    pub seed: u64,
    pub max_levels: u32,
    pub max_passes: u32,
}

impl Default for ComputationParams {
    fn default() -> Self {
        Self {
            weight_attribute: None,
            resolution: 1.0,
            seed: 0,
            max_levels: 32,
            max_passes: 8,
        }
    }
}

/// Read-only progress counters for a computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Monotonically non-decreasing amount of work completed.
    pub current: f64,
    /// Estimated total work; may be refined as the computation learns more.
    pub total: f64,
    /// Last native phase code observed.
    pub phase: u32,
}

/// Summary returned by a finalized computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationSummary {
    /// Number of entities the result covers.
    pub entity_count: u32,
    /// Number of distinct groups (communities, components, ...) found.
    pub group_count: u32,
    /// Computation-specific quality score.
    pub score: f64,
}

/// The consumed ABI of the foreign graph engine.
///
/// Implementations own the linear memory and all graph storage; this crate
/// only ever sees offsets and counts. Methods that can reallocate the
/// backing store take `&mut self` so the runtime can funnel them through
/// its buffer access guard.
pub trait GraphEngine {
    // Topology counts and capacities.
    fn entity_count(&self, kind: EntityKind) -> usize;
    fn entity_capacity(&self, kind: EntityKind) -> usize;

    /// Whether edges are directed. Snapshot metadata; the runtime itself
    /// is direction-agnostic.
    fn is_directed(&self) -> bool;

    /// Raw window descriptor for the entity id space of `kind`.
    fn topology_raw(&self, kind: EntityKind) -> RawBuffer;

    /// Whether a custom (non-index) iteration order is active for `kind`.
    /// A custom order disqualifies arithmetic aliasing.
    fn has_custom_order(&self, kind: EntityKind) -> bool;

    // Mutations. All of these may reallocate linear memory.
    fn add_nodes(&mut self, count: usize) -> Result<Vec<u32>>;
    /// Removes nodes along with their incident edges; returns the ids of
    /// the edges that were removed as a side effect.
    fn remove_nodes(&mut self, ids: &[u32]) -> Result<Vec<u32>>;
    fn add_edges(&mut self, pairs: &[(u32, u32)]) -> Result<Vec<u32>>;
    fn remove_edges(&mut self, ids: &[u32]) -> Result<()>;

    /// Endpoints of an edge, if it is active.
    fn edge_endpoints(&self, id: u32) -> Option<(u32, u32)>;

    // Attributes.
    fn define_attribute(
        &mut self,
        kind: EntityKind,
        name: &str,
        element: ElementType,
        dimension: usize,
    ) -> Result<()>;
    fn has_attribute(&self, kind: EntityKind, name: &str) -> bool;
    fn attribute_meta(&self, kind: EntityKind, name: &str) -> Option<AttributeMeta>;
    /// Raw descriptor for the capacity-sized backing buffer of an attribute.
    fn attribute_raw(&self, kind: EntityKind, name: &str) -> Result<RawBuffer>;
    /// Gathers active entities' values into a fresh contiguous buffer
    /// (engine-chosen order) and returns its descriptor. Allocates.
    fn repack_attribute(&mut self, kind: EntityKind, name: &str) -> Result<RawBuffer>;
    /// Gathers the active entity ids into a fresh contiguous u32 buffer.
    /// Only needed when the active range is not contiguous; the dense
    /// layer synthesizes the id list locally otherwise. Allocates.
    fn repack_indices(&mut self, kind: EntityKind) -> Result<RawBuffer>;

    // Linear memory.
    fn memory(&self) -> &[u8];
    fn memory_mut(&mut self) -> &mut [u8];

    // Native version counters. Engines without them return None and the
    // tracker falls back to pure local counting.
    fn native_version(&self, scope: &VersionScope) -> Option<u64>;
    fn bump_native_version(&mut self, scope: &VersionScope) -> Option<u64>;

    // Computation handle ABI.
    fn supports_computation(&self, kind: &str) -> bool;
    fn computation_create(
        &mut self,
        kind: &str,
        params: &ComputationParams,
    ) -> Result<ComputationHandle>;
    /// Advances by at most `budget` work units and returns the phase code.
    fn computation_step(&mut self, handle: ComputationHandle, budget: u32) -> Result<u32>;
    fn computation_progress(&self, handle: ComputationHandle) -> Result<ProgressReport>;
    /// Writes the result into the destination attribute (defining it if
    /// absent) and returns the summary. Only legal once the phase is done.
    fn computation_finalize(
        &mut self,
        handle: ComputationHandle,
        out_name: &str,
    ) -> Result<ComputationSummary>;
    fn computation_destroy(&mut self, handle: ComputationHandle);
}
