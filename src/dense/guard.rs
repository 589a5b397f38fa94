//! The buffer access guard.
//!
//! Foreign linear memory is one shared resource. A descriptor-derived view
//! must never be held across a call that can reallocate the backing store
//! (adding/removing entities, defining attributes, repacking). This guard
//! is the sole mutual-exclusion mechanism: while any token is live, every
//! allocation-capable operation fails with
//! [`RuntimeError::BufferAccessActive`](crate::RuntimeError::BufferAccessActive)
//! instead of silently producing a use-after-free. There is no reentrant
//! locking; a violation is a caller bug surfaced immediately.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, RuntimeError};

/// Counter of live buffer accesses.
#[derive(Debug, Default)]
pub struct AccessGuard {
    live: AtomicUsize,
}

impl AccessGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new live access and returns its RAII token.
    pub fn enter(&self) -> AccessToken<'_> {
        self.live.fetch_add(1, Ordering::AcqRel);
        AccessToken { guard: self }
    }

    /// Whether any access is currently live.
    pub fn active(&self) -> bool {
        self.live.load(Ordering::Acquire) > 0
    }

    /// Fails with the documented error if an access is live.
    ///
    /// `operation` names the rejected call in the error message.
    pub fn assert_can_allocate(&self, operation: &'static str) -> Result<()> {
        if self.active() {
            return Err(RuntimeError::BufferAccessActive(operation));
        }
        Ok(())
    }
}

/// RAII token representing one live buffer access.
pub struct AccessToken<'a> {
    guard: &'a AccessGuard,
}

impl Drop for AccessToken<'_> {
    fn drop(&mut self) {
        self.guard.live.fetch_sub(1, Ordering::AcqRel);
    }
}
