//! Tracing bootstrap for embedders.
//!
//! The runtime emits structured events on the `tracing` facade: cache
//! hits and repacks at trace/debug, session lifecycle at debug/info,
//! auto-cancellations and worker failures at warn. Hosts with their own
//! subscriber can ignore this module; `init_logging` is for binaries and
//! tests that want a quick env-filtered console subscriber. Thread ids
//! are included so interleaved worker and host events stay attributable.

use crate::error::{Result, RuntimeError};
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| RuntimeError::InvalidArgument(format!("Invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| RuntimeError::InvalidArgument("Logging already initialized".into()))
}
