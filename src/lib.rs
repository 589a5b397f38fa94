//! Lattice: a runtime substrate over a foreign linear-memory graph engine.
//!
//! The engine proper — storage layout, community detection, packing —
//! lives behind the [`GraphEngine`] trait and is reached only through
//! entry points and raw byte offsets. This crate supplies everything a
//! host needs on this side of that boundary:
//!
//! - **Version tracking** ([`version`]): per-scope monotonic counters
//!   answering "did this change since I last looked", with native engine
//!   counters authoritative when present.
//! - **Dense buffer cache** ([`dense`]): flat views over active entities'
//!   data, aliasing existing storage when the active range is contiguous
//!   and repacking natively otherwise, guarded against use-after-free by
//!   version tags and a buffer access guard.
//! - **Steppable sessions** ([`session`]): long computations driven in
//!   budgeted or time-boxed increments, auto-canceled when watched state
//!   mutates mid-flight.
//! - **Worker delegation** ([`worker`]): snapshot a graph, run the
//!   computation on a dedicated thread, re-validate before applying the
//!   result to the live graph.
//!
//! # Example
//!
//! ```no_run
//! use lattice::{GraphRuntime, MemoryEngine, SessionConfig, StepOptions};
//! use lattice::session::Phase;
//!
//! # fn main() -> lattice::Result<()> {
//! let runtime = GraphRuntime::new(MemoryEngine::new());
//! let nodes = runtime.add_nodes(3)?;
//! runtime.add_edges(&[(nodes[0], nodes[1]), (nodes[1], nodes[2])])?;
//!
//! let mut session = runtime.create_session(SessionConfig::new("components"))?;
//! while session.step(StepOptions::default())? != Phase::Done {}
//! let summary = session.finalize()?;
//! println!("{} groups", summary.group_count);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dense;
pub mod engine;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod session;
pub mod version;
pub mod worker;

pub use config::RuntimeConfig;
pub use dense::view::{DenseView, DenseViewMut, IndexView};
pub use dense::{BufferDescriptor, BufferMode};
pub use engine::memory::MemoryEngine;
pub use engine::{
    ComputationParams, ComputationSummary, ElementType, EntityKind, GraphEngine, ProgressReport,
};
pub use error::{Result, RuntimeError};
pub use logging::init_logging;
pub use runtime::GraphRuntime;
pub use session::{Phase, RunOptions, Session, SessionConfig, StepOptions};
pub use version::{VersionScope, VersionTracker, VERSION_UNKNOWN};
pub use worker::{WorkerClient, WorkerHost, WorkerResult, WorkerSnapshot};
