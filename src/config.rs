//! Runtime configuration options.
//!
//! This module provides the configuration structure controlling default
//! session step budgets, cooperative time-boxing, and worker pacing.
//!
//! # Configuration Presets
//!
//! - [`RuntimeConfig::default()`] - Balanced defaults matching the native engine
//! - [`RuntimeConfig::interactive()`] - Small chunks for latency-sensitive hosts
//! - [`RuntimeConfig::throughput()`] - Large budgets for batch-style driving
//!
//! # Example
//!
//! ```rust
//! use lattice::RuntimeConfig;
//!
//! let mut config = RuntimeConfig::interactive();
//! config.step_budget = 2000;
//! ```

/// Configuration options for [`GraphRuntime`](crate::GraphRuntime) behavior.
///
/// These are defaults only; every session call accepts explicit
/// [`StepOptions`](crate::session::StepOptions) that override them.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default number of work units a single `step` call may consume.
    pub step_budget: u32,

    /// Default chunk size used when a `step` call is time-boxed.
    ///
    /// A time-boxed step advances in synchronous increments of this many
    /// units; overrun past the deadline is bounded by one chunk.
    pub chunk_budget: u32,

    /// Default wall-clock deadline for a time-boxed `step`, in
    /// milliseconds. `None` means a single budgeted advance per call.
    pub step_timeout_ms: Option<u64>,

    /// Milliseconds a `run` loop (and the worker host loop) sleeps
    /// between steps to yield to co-resident work. Zero still yields
    /// the thread, it just does not sleep.
    pub yield_ms: u64,

    /// Hard cap on `run` loop iterations. Guards against a native
    /// computation that never reaches a terminal phase.
    pub max_run_iterations: usize,

    /// Whether virtual identity index buffers may be synthesized locally
    /// when the active id range is contiguous. Disabling forces the
    /// native repack path (useful for diagnosing aliasing issues).
    pub identity_buffers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            step_budget: 5000,
            chunk_budget: 5000,
            step_timeout_ms: None,
            yield_ms: 0,
            max_run_iterations: 1_000_000,
            identity_buffers: true,
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration for latency-sensitive hosts.
    ///
    /// Small chunks and a short per-step deadline keep any single
    /// synchronous slice well under a frame budget.
    pub fn interactive() -> Self {
        Self {
            step_budget: 5000,
            chunk_budget: 1000,
            step_timeout_ms: Some(8),
            yield_ms: 0,
            max_run_iterations: 1_000_000,
            identity_buffers: true,
        }
    }

    /// Creates a configuration for batch-style driving.
    ///
    /// Large budgets minimize crossing overhead when nothing else shares
    /// the calling context.
    pub fn throughput() -> Self {
        Self {
            step_budget: 100_000,
            chunk_budget: 100_000,
            step_timeout_ms: Some(60),
            yield_ms: 0,
            max_run_iterations: 10_000_000,
            identity_buffers: true,
        }
    }
}
