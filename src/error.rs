//! Error handling for lattice operations.
//!
//! This module defines the error types used throughout the runtime
//! substrate. All public APIs return `Result<T, RuntimeError>`.
//!
//! # Error Classes
//!
//! Errors fall into five classes, each mapped to distinct variants so
//! callers can tell them apart:
//!
//! - *Construction errors* — [`RuntimeError::MissingEntryPoint`],
//!   [`RuntimeError::InvalidArgument`]: immediate, never retried.
//! - *Use-after-invalidate* — [`RuntimeError::Disposed`],
//!   [`RuntimeError::BufferAccessActive`]: always fatal.
//! - *Cancellation-by-mutation* — [`RuntimeError::Canceled`]: carries the
//!   reason naming the changed scope, distinct from a native failure.
//! - *Native computation failure* — [`RuntimeError::NativeFailure`]: fatal,
//!   no partial result is trusted.
//! - *Cross-boundary mismatch* — [`RuntimeError::SnapshotMismatch`]: a worker
//!   result no longer lines up with the live graph; nothing is written.
//!
//! Propagation is synchronous at the call that discovers the condition;
//! there is no deferred error queue and no automatic retry anywhere.

use thiserror::Error;

/// Result type for lattice operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while driving the foreign graph engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A required native entry point is not exported by the engine.
    ///
    /// Raised at construction time, e.g. when creating a session of a
    /// kind the engine does not implement.
    #[error("missing native entry point: {0}")]
    MissingEntryPoint(String),

    /// Invalid argument or operation.
    ///
    /// Covers empty selections, malformed edge lists, finalizing a
    /// session that is not done, and type/dimension conflicts on
    /// pre-existing destination attributes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested resource was not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Operation on a disposed handle (runtime, session, or worker side).
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// An allocation-capable operation was attempted while a buffer
    /// access guard is active.
    ///
    /// Foreign linear memory is a shared resource; while any
    /// descriptor-derived view is live, calls that could reallocate or
    /// repack the backing store fail fast instead of silently producing
    /// a use-after-free.
    #[error("cannot {0} while a buffer access guard is active")]
    BufferAccessActive(&'static str),

    /// The session was canceled, either explicitly or because a watched
    /// version changed mid-flight.
    ///
    /// The reason names the changed scope (e.g. `node attribute
    /// "weight" changed`) so callers can tell cancellation-by-mutation
    /// apart from a native failure.
    #[error("session canceled: {reason}")]
    Canceled {
        /// Human-readable reason, naming the changed scope when the
        /// cancellation was triggered by a version mismatch.
        reason: String,
    },

    /// The native computation reported a failed phase.
    #[error("native computation failed: {0}")]
    NativeFailure(String),

    /// A delegated result's entity count disagrees with the live graph.
    ///
    /// The graph may have mutated while delegation was in flight; the
    /// apply step refuses to write misaligned data.
    #[error("snapshot mismatch: result covers {result} entities but the graph now has {live}")]
    SnapshotMismatch {
        /// Entity count carried by the worker result.
        result: usize,
        /// Current live entity count at apply time.
        live: usize,
    },

    /// The worker channel closed unexpectedly.
    #[error("worker channel closed: {0}")]
    Channel(String),

    /// Error during serialization or deserialization of a payload.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}
